use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use tracing::info;

use super::config::{CapsuleLossKind, LossConfig};
use super::layers::EPSILON;
use crate::error::{CapsError, Result};

/// Trait pour les losses sur `(N, K)`, calculées par échantillon
pub trait LossFunction: Send + Sync {
    fn per_sample(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Array1<f32>;

    /// Gradient de la loss de chaque échantillon, la réduction est faite par l'appelant.
    fn per_sample_gradient(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>)
        -> Array2<f32>;

    fn compute(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> f32 {
        self.per_sample(y_true, y_pred).mean().unwrap_or(0.0)
    }
}

/// Margin loss sur les longueurs de capsules (Sabour et al., 2017).
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }
}

impl Default for MarginLoss {
    fn default() -> Self {
        let config = LossConfig::default();
        Self::new(
            config.positive_margin,
            config.negative_margin,
            config.down_weighting,
        )
    }
}

impl LossFunction for MarginLoss {
    fn per_sample(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Array1<f32> {
        let mut terms = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut terms)
            .and(y_true)
            .and(y_pred)
            .for_each(|l, &y, &p| {
                let present = (self.positive_margin - p).max(0.0);
                let absent = (p - self.negative_margin).max(0.0);
                *l = y * present * present + self.down_weighting * (1.0 - y) * absent * absent;
            });
        terms.sum_axis(Axis(1))
    }

    fn per_sample_gradient(
        &self,
        y_true: &ArrayView2<f32>,
        y_pred: &ArrayView2<f32>,
    ) -> Array2<f32> {
        let mut grad = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut grad)
            .and(y_true)
            .and(y_pred)
            .for_each(|g, &y, &p| {
                let present = (self.positive_margin - p).max(0.0);
                let absent = (p - self.negative_margin).max(0.0);
                *g = -2.0 * y * present + 2.0 * self.down_weighting * (1.0 - y) * absent;
            });
        grad
    }
}

/// `Σ_k max(0, m − (y − p))² − m²` par échantillon.
#[derive(Debug, Clone)]
pub struct SpreadLoss {
    pub margin: f32,
}

impl SpreadLoss {
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }
}

impl LossFunction for SpreadLoss {
    fn per_sample(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Array1<f32> {
        let hinge = (y_pred - y_true).mapv_into(|d| (self.margin + d).max(0.0).powi(2));
        hinge.sum_axis(Axis(1)) - self.margin * self.margin
    }

    fn per_sample_gradient(
        &self,
        y_true: &ArrayView2<f32>,
        y_pred: &ArrayView2<f32>,
    ) -> Array2<f32> {
        (y_pred - y_true).mapv_into(|d| 2.0 * (self.margin + d).max(0.0))
    }
}

/// Entropie croisée binaire, probabilités clippées dans `[ε, 1 − ε]`, moyenne sur le dernier axe.
#[derive(Debug, Clone, Default)]
pub struct BinaryCrossEntropy;

impl LossFunction for BinaryCrossEntropy {
    fn per_sample(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Array1<f32> {
        let mut terms = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut terms)
            .and(y_true)
            .and(y_pred)
            .for_each(|l, &y, &p| *l = binary_crossentropy_term(y, p));
        terms.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(0))
    }

    fn per_sample_gradient(
        &self,
        y_true: &ArrayView2<f32>,
        y_pred: &ArrayView2<f32>,
    ) -> Array2<f32> {
        let width = y_pred.ncols().max(1) as f32;
        let mut grad = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut grad)
            .and(y_true)
            .and(y_pred)
            .for_each(|g, &y, &p| {
                // Le clipping coupe le gradient hors de l'intervalle ouvert
                if p > EPSILON && p < 1.0 - EPSILON {
                    *g = (-y / p + (1.0 - y) / (1.0 - p)) / width;
                }
            });
        grad
    }
}

/// Entropie croisée moyennée sur tous les éléments du batch d'un coup.
pub fn custom_binary_crossentropy(y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> f32 {
    let n = y_true.len();
    if n == 0 {
        return 0.0;
    }
    let total: f32 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(&y, &p)| binary_crossentropy_term(y, p))
        .sum();
    total / n as f32
}

fn binary_crossentropy_term(y: f32, p: f32) -> f32 {
    let p = p.clamp(EPSILON, 1.0 - EPSILON);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Erreur quadratique moyennée sur les éléments hors batch.
#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError;

impl LossFunction for MeanSquaredError {
    fn per_sample(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Array1<f32> {
        (y_pred - y_true)
            .mapv_into(|d| d * d)
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(0))
    }

    fn per_sample_gradient(
        &self,
        y_true: &ArrayView2<f32>,
        y_pred: &ArrayView2<f32>,
    ) -> Array2<f32> {
        let width = y_pred.ncols().max(1) as f32;
        (y_pred - y_true) * (2.0 / width)
    }
}

pub fn capsule_loss(kind: CapsuleLossKind, config: &LossConfig) -> Box<dyn LossFunction> {
    match kind {
        CapsuleLossKind::Margin => Box::new(MarginLoss::new(
            config.positive_margin,
            config.negative_margin,
            config.down_weighting,
        )),
        CapsuleLossKind::Spread { margin } => Box::new(SpreadLoss::new(margin)),
        CapsuleLossKind::BinaryCrossEntropy => Box::new(BinaryCrossEntropy),
    }
}

/// Poids par échantillon à partir des poids de classe, indexés par l'argmax du label.
pub fn sample_weights(y_true: &ArrayView2<f32>, class_weight: &[f32]) -> Result<Array1<f32>> {
    if class_weight.len() != y_true.ncols() {
        return Err(CapsError::shape(
            "class weights",
            &[y_true.ncols()],
            &[class_weight.len()],
        ));
    }
    Ok(y_true
        .outer_iter()
        .map(|row| class_weight[argmax(&row)])
        .collect())
}

/// Coefficients qui transforment les losses par échantillon en loss pondérée du batch.
///
/// `loss = mean(w_i · l_i) / fraction(w_i ≠ 0)`, chaque échantillon contribue
/// pour `w_i / (N · fraction)`.
pub fn reduction_coefficients(batch_size: usize, weights: Option<&ArrayView1<f32>>) -> Array1<f32> {
    let n = batch_size.max(1) as f32;
    match weights {
        None => Array1::from_elem(batch_size, 1.0 / n),
        Some(w) => {
            let nonzero = w.iter().filter(|&&v| v != 0.0).count();
            if nonzero == 0 {
                return Array1::zeros(batch_size);
            }
            let fraction = nonzero as f32 / n;
            w.mapv(|v| v / (n * fraction))
        }
    }
}

/// Losses et gradients d'un batch pour les deux sorties du modèle.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    pub total: f32,
    pub capsnet: f32,
    pub reconstruction: f32,
    pub grad_class: Array2<f32>,
    pub grad_reconstruction: Array3<f32>,
}

/// `capsnet_loss + lam_recon · mse(x, reconstruction)`
pub struct CombinedLoss {
    capsule_loss: Box<dyn LossFunction>,
    reconstruction_loss: MeanSquaredError,
    pub lam_recon: f32,
}

impl CombinedLoss {
    pub fn new(kind: CapsuleLossKind, config: &LossConfig, lam_recon: f32) -> Self {
        Self {
            capsule_loss: capsule_loss(kind, config),
            reconstruction_loss: MeanSquaredError,
            lam_recon,
        }
    }

    pub fn evaluate(
        &self,
        y_true: &ArrayView2<f32>,
        class_output: &ArrayView2<f32>,
        x_true: &ArrayView3<f32>,
        reconstruction: &ArrayView3<f32>,
        weights: Option<&ArrayView1<f32>>,
    ) -> Result<LossBreakdown> {
        if y_true.dim() != class_output.dim() {
            return Err(CapsError::shape(
                "class output",
                y_true.shape(),
                class_output.shape(),
            ));
        }
        if x_true.dim() != reconstruction.dim() {
            return Err(CapsError::shape(
                "reconstruction",
                x_true.shape(),
                reconstruction.shape(),
            ));
        }

        let batch_size = y_true.nrows();
        let coefficients = reduction_coefficients(batch_size, weights);
        let column = coefficients.view().insert_axis(Axis(1));

        let capsnet = self
            .capsule_loss
            .per_sample(y_true, class_output)
            .dot(&coefficients);
        let grad_class = self.capsule_loss.per_sample_gradient(y_true, class_output) * &column;

        let (_, length, channels) = x_true.dim();
        let flat_true = x_true.to_owned().into_shape_with_order((batch_size, length * channels))?;
        let flat_recon = reconstruction
            .to_owned()
            .into_shape_with_order((batch_size, length * channels))?;
        let recon = self
            .reconstruction_loss
            .per_sample(&flat_true.view(), &flat_recon.view())
            .dot(&coefficients);
        let grad_reconstruction = (self
            .reconstruction_loss
            .per_sample_gradient(&flat_true.view(), &flat_recon.view())
            * &column
            * self.lam_recon)
            .into_shape_with_order((batch_size, length, channels))?;

        Ok(LossBreakdown {
            total: capsnet + self.lam_recon * recon,
            capsnet,
            reconstruction: recon,
            grad_class,
            grad_reconstruction,
        })
    }
}

/// Mode de calcul de l'accuracy de la sortie `capsnet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyKind {
    /// L'argmax de la prédiction égale celui du label.
    Categorical,
    /// Chaque probabilité arrondie égale son label.
    Binary,
}

impl AccuracyKind {
    pub fn for_loss(kind: CapsuleLossKind) -> Self {
        match kind {
            CapsuleLossKind::BinaryCrossEntropy => AccuracyKind::Binary,
            _ => AccuracyKind::Categorical,
        }
    }
}

pub(crate) fn argmax(row: &ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (k, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = k;
        }
    }
    best
}

/// Nombre de prédictions correctes, sommé pour pouvoir cumuler les batchs.
pub fn correct_count(kind: AccuracyKind, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> f32 {
    match kind {
        AccuracyKind::Categorical => y_true
            .outer_iter()
            .zip(y_pred.outer_iter())
            .filter(|(t, p)| argmax(t) == argmax(p))
            .count() as f32,
        AccuracyKind::Binary => {
            let width = y_pred.ncols().max(1) as f32;
            let mut hits = 0.0;
            Zip::from(y_true).and(y_pred).for_each(|&t, &p| {
                if (p.round() - t).abs() < 0.5 {
                    hits += 1.0;
                }
            });
            hits / width
        }
    }
}

/// Métriques d'évaluation
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    /// Compare les sorties de classe (longueurs ou probabilités) aux labels one-hot.
    pub fn compute(y_pred: &ArrayView2<f32>, y_true: &ArrayView2<f32>) -> Self {
        let (batch_size, num_classes) = y_pred.dim();

        let mut confusion = vec![vec![0; num_classes]; num_classes];
        let mut correct = 0;

        for (pred, truth) in y_pred.outer_iter().zip(y_true.outer_iter()) {
            let pred_class = argmax(&pred);
            let true_class = argmax(&truth);
            confusion[true_class][pred_class] += 1;
            if pred_class == true_class {
                correct += 1;
            }
        }

        let accuracy = if batch_size > 0 {
            correct as f32 / batch_size as f32
        } else {
            0.0
        };

        let mut precision = Vec::new();
        let mut recall = Vec::new();
        let mut f1_score = Vec::new();

        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let fp: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[i][c] as f32)
                .sum();
            let fn_: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[c][i] as f32)
                .sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 {
                2.0 * prec * rec / (prec + rec)
            } else {
                0.0
            };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
        }

        Self {
            accuracy,
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
        }
    }

    pub fn log(&self) {
        info!(accuracy = self.accuracy, "evaluation metrics");
        for (i, ((p, r), f1)) in self
            .precision
            .iter()
            .zip(&self.recall)
            .zip(&self.f1_score)
            .enumerate()
        {
            info!(class = i, precision = p, recall = r, f1 = f1, "per-class metrics");
        }
        for row in &self.confusion_matrix {
            info!(?row, "confusion matrix");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    #[test]
    fn margin_loss_sums_classes_and_averages_batch() {
        let loss = MarginLoss::default();
        let y = array![[1.0f32, 0.0], [0.0, 1.0]];
        let p = array![[0.5f32, 0.5], [0.95, 0.05]];
        // échantillon 0 : (0.4)^2 + 0.5 * (0.4)^2 = 0.24
        // échantillon 1 : 0.5 * (0.85)^2 + (0.85)^2 = 1.08375
        let per_sample = loss.per_sample(&y.view(), &p.view());
        assert_abs_diff_eq!(per_sample[0], 0.24, epsilon = 1e-5);
        assert_abs_diff_eq!(per_sample[1], 1.08375, epsilon = 1e-5);
        assert_abs_diff_eq!(loss.compute(&y.view(), &p.view()), (0.24 + 1.08375) / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn margin_loss_is_zero_beyond_margins() {
        let loss = MarginLoss::default();
        let y = array![[1.0f32, 0.0]];
        let p = array![[0.95f32, 0.05]];
        assert_abs_diff_eq!(loss.compute(&y.view(), &p.view()), 0.0);
        let grad = loss.per_sample_gradient(&y.view(), &p.view());
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    /// Différences centrées de la somme des losses par échantillon.
    fn numeric_gradient(loss: &dyn LossFunction, y: &Array2<f32>, p: &Array2<f32>) -> Array2<f32> {
        let h = 1e-3;
        Array2::from_shape_fn(p.raw_dim(), |(i, k)| {
            let mut plus = p.clone();
            plus[[i, k]] += h;
            let mut minus = p.clone();
            minus[[i, k]] -= h;
            (loss.per_sample(&y.view(), &plus.view()).sum()
                - loss.per_sample(&y.view(), &minus.view()).sum())
                / (2.0 * h)
        })
    }

    fn assert_gradient_matches(loss: &dyn LossFunction, y: &Array2<f32>, p: &Array2<f32>) {
        let analytic = loss.per_sample_gradient(&y.view(), &p.view());
        let numeric = numeric_gradient(loss, y, p);
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(*a, *n, epsilon = 1e-2);
        }
    }

    #[test]
    fn loss_gradients_match_finite_differences() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0]];

        // tous les termes entre les marges
        let p = array![[0.5f32, 0.3], [0.2, 0.6]];
        let margin = MarginLoss::default();
        assert!(margin.per_sample_gradient(&y.view(), &p.view()).iter().all(|&g| g != 0.0));
        assert_gradient_matches(&margin, &y, &p);

        // une charnière inactive (0.7 - 1 + 0.2 < 0), trois actives
        let p = array![[0.7f32, 0.4], [0.1, 0.9]];
        assert_gradient_matches(&SpreadLoss::new(0.2), &y, &p);

        let p = array![[0.7f32, 0.2], [0.4, 0.9]];
        assert_gradient_matches(&BinaryCrossEntropy, &y, &p);

        let flat = array![[0.3f32, 0.8, 0.5], [0.1, 0.0, 0.9]];
        let target = array![[0.0f32, 1.0, 1.0], [0.5, 0.0, 1.0]];
        assert_gradient_matches(&MeanSquaredError, &target, &flat);
    }

    #[test]
    fn spread_loss_subtracts_squared_margin() {
        let loss = SpreadLoss::new(0.2);
        let y = array![[1.0f32, 0.0]];
        let p = array![[1.0f32, 0.0]];
        // deux termes : max(0, 0.2 - 0)^2 = 0.04 -> 0.08 - 0.04
        assert_abs_diff_eq!(loss.compute(&y.view(), &p.view()), 0.04, epsilon = 1e-6);
    }

    #[test]
    fn binary_crossentropy_matches_closed_form() {
        let y = array![[1.0f32, 0.0]];
        let p = array![[0.8f32, 0.2]];
        let expected = -(0.8f32.ln());
        assert_abs_diff_eq!(BinaryCrossEntropy.compute(&y.view(), &p.view()), expected, epsilon = 1e-5);
        assert_abs_diff_eq!(custom_binary_crossentropy(&y.view(), &p.view()), expected, epsilon = 1e-5);
    }

    #[test]
    fn binary_crossentropy_clips_saturated_predictions() {
        let y = array![[1.0f32, 0.0]];
        let p = array![[0.0f32, 1.0]];
        let loss = BinaryCrossEntropy.compute(&y.view(), &p.view());
        assert!(loss.is_finite());
        assert!(loss > 15.0);
    }

    #[test]
    fn class_weights_follow_weighted_reduction() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 1.0], [1.0, 0.0]];
        let weights = sample_weights(&y.view(), &[0.0, 2.0]).unwrap();
        assert_eq!(weights, array![0.0f32, 2.0, 2.0, 0.0]);
        // mean(w * l) / 0.5 avec l = 1 -> (4 / 4) / 0.5 = 2
        let coefficients = reduction_coefficients(4, Some(&weights.view()));
        assert_abs_diff_eq!(coefficients.dot(&Array1::ones(4)), 2.0, epsilon = 1e-6);
    }

    #[test]
    fn combined_loss_weights_reconstruction() {
        let combined = CombinedLoss::new(CapsuleLossKind::Margin, &LossConfig::default(), 0.5);
        let y = array![[1.0f32, 0.0]];
        let p = array![[0.95f32, 0.05]];
        let x = Array3::from_elem((1, 2, 2), 1.0f32);
        let recon = Array3::from_elem((1, 2, 2), 0.5f32);
        let breakdown = combined
            .evaluate(&y.view(), &p.view(), &x.view(), &recon.view(), None)
            .unwrap();
        assert_abs_diff_eq!(breakdown.capsnet, 0.0);
        assert_abs_diff_eq!(breakdown.reconstruction, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(breakdown.total, 0.125, epsilon = 1e-6);
        // d/dr 0.5 * mean((r - x)^2) = 0.5 * 2 * (-0.5) / 4
        assert_abs_diff_eq!(breakdown.grad_reconstruction[[0, 0, 0]], -0.125, epsilon = 1e-6);
    }

    #[test]
    fn weighted_combined_gradients_match_finite_differences() {
        let combined = CombinedLoss::new(CapsuleLossKind::Margin, &LossConfig::default(), 0.4);
        let y = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let p = array![[0.5f32, 0.3], [0.2, 0.6], [0.7, 0.4]];
        let x = Array3::from_shape_fn((3, 2, 2), |(b, l, c)| ((b + l + c) % 2) as f32);
        let recon = Array3::from_shape_fn((3, 2, 2), |(b, l, c)| 0.2 + 0.1 * (b + 2 * l + c) as f32);
        // un poids nul change le dénominateur de la réduction
        let weights = array![0.0f32, 2.0, 1.0];

        let total = |p: &Array2<f32>, r: &Array3<f32>| {
            combined
                .evaluate(&y.view(), &p.view(), &x.view(), &r.view(), Some(&weights.view()))
                .unwrap()
                .total
        };
        let breakdown = combined
            .evaluate(&y.view(), &p.view(), &x.view(), &recon.view(), Some(&weights.view()))
            .unwrap();

        let h = 1e-3;
        for i in 0..3 {
            for k in 0..2 {
                let mut plus = p.clone();
                plus[[i, k]] += h;
                let mut minus = p.clone();
                minus[[i, k]] -= h;
                let numeric = (total(&plus, &recon) - total(&minus, &recon)) / (2.0 * h);
                assert_abs_diff_eq!(breakdown.grad_class[[i, k]], numeric, epsilon = 1e-2);
            }
        }
        assert_abs_diff_eq!(breakdown.grad_class[[0, 0]], 0.0);

        for idx in [[1, 0, 1], [2, 1, 0]] {
            let mut plus = recon.clone();
            plus[idx] += h;
            let mut minus = recon.clone();
            minus[idx] -= h;
            let numeric = (total(&p, &plus) - total(&p, &minus)) / (2.0 * h);
            assert_abs_diff_eq!(breakdown.grad_reconstruction[idx], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn accuracy_kinds() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0]];
        let p = array![[0.7f32, 0.6], [0.4, 0.3]];
        assert_abs_diff_eq!(correct_count(AccuracyKind::Categorical, &y.view(), &p.view()), 1.0);
        // arrondi : [1, 1] vs [1, 0] -> 0.5, [0, 0] vs [0, 1] -> 0.5
        assert_abs_diff_eq!(correct_count(AccuracyKind::Binary, &y.view(), &p.view()), 1.0);
    }

    #[test]
    fn metrics_confusion_matrix() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let p = array![[0.9f32, 0.1], [0.8, 0.2], [0.1, 0.9]];
        let metrics = Metrics::compute(&p.view(), &y.view());
        assert_eq!(metrics.confusion_matrix, vec![vec![1, 0], vec![1, 1]]);
        assert_abs_diff_eq!(metrics.precision[0], 0.5);
        assert_abs_diff_eq!(metrics.recall[1], 0.5);
    }
}
