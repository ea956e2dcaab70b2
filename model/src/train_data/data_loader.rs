use ndarray::{s, Array2, Array3, ArrayD, Axis, Ix3};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{CapsError, Result};

/// Les 20 acides aminés standards plus `X` pour un résidu inconnu.
pub const PROTEIN_ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWYX";

/// Séquences encodées en one-hot et leurs labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// `(N, L, |alphabet|)`
    pub x: Array3<f32>,
    /// `(N, n_class)`
    pub y: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Nombre d'échantillons par classe.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.y.ncols()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }
}

/// Chargeur de fichiers `label<TAB>séquence` en tenseurs one-hot
pub struct SequenceDataLoader {
    path: PathBuf,
    alphabet: Vec<char>,
    index: HashMap<char, usize>,
}

impl SequenceDataLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_alphabet(path, PROTEIN_ALPHABET)
    }

    pub fn with_alphabet<P: AsRef<Path>>(path: P, alphabet: &str) -> Self {
        let alphabet: Vec<char> = alphabet.chars().map(|c| c.to_ascii_uppercase()).collect();
        let index = alphabet.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self {
            path: path.as_ref().to_path_buf(),
            alphabet,
            index,
        }
    }

    pub fn channels(&self) -> usize {
        self.alphabet.len()
    }

    /// `(L, |alphabet|)`, les résidus hors alphabet donnent une ligne de zéros.
    pub fn encode_sequence(&self, sequence: &str) -> Array2<f32> {
        let residues: Vec<char> = sequence.trim().chars().collect();
        let mut encoded = Array2::zeros((residues.len(), self.channels()));
        for (position, residue) in residues.iter().enumerate() {
            if let Some(&channel) = self.index.get(&residue.to_ascii_uppercase()) {
                encoded[[position, channel]] = 1.0;
            }
        }
        encoded
    }

    pub fn load(&self, nb_classes: usize) -> Result<Dataset> {
        let start = Instant::now();
        let contents = fs::read_to_string(&self.path)?;

        let mut labels = Vec::new();
        let mut sequences = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (label, sequence) = line.split_once('\t').ok_or_else(|| {
                CapsError::Data(format!("line {}: expected label<TAB>sequence", line_no + 1))
            })?;
            let label: usize = label.trim().parse().map_err(|_| {
                CapsError::Data(format!("line {}: invalid label {:?}", line_no + 1, label))
            })?;
            labels.push(label);
            sequences.push(sequence.trim());
        }

        let length = match sequences.first() {
            Some(first) => first.chars().count(),
            None => {
                return Err(CapsError::Data(format!(
                    "{} contains no sequences",
                    self.path.display()
                )))
            }
        };
        let mut x = Array3::zeros((sequences.len(), length, self.channels()));
        for (i, sequence) in sequences.iter().enumerate() {
            let got = sequence.chars().count();
            if got != length {
                return Err(CapsError::Data(format!(
                    "sequence {} has length {}, expected {}",
                    i + 1,
                    got,
                    length
                )));
            }
            x.slice_mut(s![i, .., ..]).assign(&self.encode_sequence(sequence));
        }
        let y = to_categorical(&labels, nb_classes)?;

        let dataset = Dataset { x, y, labels };
        info!(
            path = %self.path.display(),
            samples = dataset.len(),
            length,
            classes = ?dataset.class_counts(),
            "dataset loaded"
        );
        debug!(elapsed = ?start.elapsed(), "dataset parsing");
        Ok(dataset)
    }
}

/// Labels one-hot, `(N, nb_classes)`.
pub fn to_categorical(labels: &[usize], nb_classes: usize) -> Result<Array2<f32>> {
    let mut y = Array2::zeros((labels.len(), nb_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= nb_classes {
            return Err(CapsError::Data(format!(
                "label {} out of range for {} classes",
                label, nb_classes
            )));
        }
        y[[i, label]] = 1.0;
    }
    Ok(y)
}

/// Entrées et labels one-hot partageant leur premier axe.
pub type Labelled = (Array3<f32>, Array2<f32>);

/// Garde les premières lignes et réserve la dernière `fraction`.
///
/// Le nombre réservé est arrondi vers le bas : un petit jeu peut ne rien réserver.
pub fn split_tail(x: &Array3<f32>, y: &Array2<f32>, fraction: f32) -> Result<(Labelled, Labelled)> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(CapsError::Config(format!(
            "split fraction {} outside [0, 1)",
            fraction
        )));
    }
    let n = x.dim().0;
    if y.nrows() != n {
        return Err(CapsError::shape("split labels", &[n, y.ncols()], y.shape()));
    }
    let split = n - (n as f32 * fraction) as usize;
    let head = (x.slice(s![..split, .., ..]).to_owned(), y.slice(s![..split, ..]).to_owned());
    let tail = (x.slice(s![split.., .., ..]).to_owned(), y.slice(s![split.., ..]).to_owned());
    Ok((head, tail))
}

/// Accepte `(N, L, C)` ou `(N, 1, L, C)` et renvoie `(N, L, C)`.
pub fn normalize_input_rank(x: ArrayD<f32>) -> Result<Array3<f32>> {
    match x.ndim() {
        3 => Ok(x.into_dimensionality::<Ix3>()?),
        4 if x.shape()[1] == 1 => Ok(x.index_axis_move(Axis(1), 0).into_dimensionality::<Ix3>()?),
        _ => {
            let shape = x.shape().to_vec();
            let expected = match shape.as_slice() {
                [n, _, l, c] => vec![*n, 1, *l, *c],
                _ => vec![0, 0, 0],
            };
            Err(CapsError::shape("sequence input rank", &expected, &shape))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use std::io::Write;

    fn write_dataset(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("seq_capsnet_{}_{}.tsv", name, std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn one_hot_encodes_and_zeroes_unknown_residues() {
        let loader = SequenceDataLoader::with_alphabet("unused", "ACGT");
        let encoded = loader.encode_sequence("acgN");
        assert_eq!(encoded.dim(), (4, 4));
        assert_eq!(encoded.row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(encoded.row(2).to_vec(), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(encoded.row(3).sum(), 0.0);
    }

    #[test]
    fn loads_labelled_sequences() {
        let path = write_dataset(
            "load",
            "# label\tsequence\n1\tMKVL\n0\tAXKL\n\n1\tWWWW\n",
        );
        let dataset = SequenceDataLoader::new(&path).load(2).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.x.dim(), (3, 4, 21));
        assert_eq!(dataset.labels, vec![1, 0, 1]);
        assert_eq!(dataset.class_counts(), vec![1, 2]);
        assert_eq!(dataset.y.row(1).to_vec(), vec![1.0, 0.0]);
        // X fait partie de l'alphabet protéique
        assert_eq!(dataset.x.slice(s![1, 1, ..]).sum(), 1.0);
    }

    #[test]
    fn rejects_ragged_sequences_and_bad_labels() {
        let ragged = write_dataset("ragged", "0\tMKV\n1\tMK\n");
        let result = SequenceDataLoader::new(&ragged).load(2);
        fs::remove_file(&ragged).ok();
        assert!(matches!(result, Err(CapsError::Data(_))));

        let bad_label = write_dataset("label", "3\tMKV\n");
        let result = SequenceDataLoader::new(&bad_label).load(2);
        fs::remove_file(&bad_label).ok();
        assert!(matches!(result, Err(CapsError::Data(_))));
    }

    #[test]
    fn categorical_labels() {
        let y = to_categorical(&[0, 2, 1], 3).unwrap();
        assert_eq!(y.sum_axis(Axis(1)).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(y[[1, 2]], 1.0);
        assert!(to_categorical(&[2], 2).is_err());
    }

    #[test]
    fn split_holds_out_the_tail() {
        let x = Array3::from_shape_fn((10, 2, 2), |(b, _, _)| b as f32);
        let y = to_categorical(&[0, 1, 0, 1, 0, 1, 0, 1, 0, 1], 2).unwrap();
        let ((train_x, train_y), (held_x, held_y)) = split_tail(&x, &y, 0.2).unwrap();
        assert_eq!(train_x.dim().0, 8);
        assert_eq!(train_y.nrows(), 8);
        assert_eq!(held_x.dim().0, 2);
        assert_eq!(held_x[[0, 0, 0]], 8.0);
        assert_eq!(held_y.row(1).to_vec(), vec![0.0, 1.0]);

        // 5 * 0.1 arrondi à zéro
        let small_x = x.slice(s![..5, .., ..]).to_owned();
        let small_y = y.slice(s![..5, ..]).to_owned();
        let ((train_x, _), (held_x, _)) = split_tail(&small_x, &small_y, 0.1).unwrap();
        assert_eq!(train_x.dim().0, 5);
        assert_eq!(held_x.dim().0, 0);

        assert!(matches!(split_tail(&x, &y, 1.0), Err(CapsError::Config(_))));
    }

    #[test]
    fn normalizes_four_dimensional_input() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[5, 1, 7, 3]));
        assert_eq!(normalize_input_rank(x).unwrap().dim(), (5, 7, 3));

        let x = ArrayD::<f32>::zeros(IxDyn(&[5, 7, 3]));
        assert_eq!(normalize_input_rank(x).unwrap().dim(), (5, 7, 3));

        let x = ArrayD::<f32>::zeros(IxDyn(&[5, 2, 7, 3]));
        assert!(matches!(normalize_input_rank(x), Err(CapsError::Shape { .. })));
    }
}
