use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{info, warn};

use super::capsule::{
    capsule_length, capsule_length_backward, extract_backward, extract_outputs, extract_weight_c,
    longest_capsule_selector, mask, mask_backward, DigitCapsLayer, PrimaryCapsLayer,
};
use super::config::{Activation, NetworkConfig, TrainingConfig};
use super::decoder::Decoder;
use super::layers::{Layer, Mode, Param, SequenceLayer};
use super::loss::{argmax, correct_count, sample_weights, AccuracyKind, CombinedLoss};
use super::optimizer::{apply_gradients, LRScheduler, LearningRateMonitor, Optimizer};
use crate::error::{CapsError, Result};

/// Réseau de capsules sur des fenêtres de séquence, avec décodeur de reconstruction.
///
/// Un seul jeu de poids, atteint par quatre points d'entrée :
/// [`train_forward`](Self::train_forward) masque l'entrée du décodeur
/// avec les labels, [`evaluate`](Self::evaluate) avec la capsule la plus longue,
/// [`manipulate`](Self::manipulate) perturbe les capsules avant décodage et
/// [`coupling_coefficients`](Self::coupling_coefficients) expose le routing.
pub struct CapsNet {
    pub network_config: NetworkConfig,
    feature_layers: Vec<Box<dyn SequenceLayer>>,
    primary: PrimaryCapsLayer,
    digit: DigitCapsLayer,
    decoder: Decoder,
    cache: Option<ForwardCache>,
}

/// Cache du dernier `train_forward`, consommé par `backward`.
struct ForwardCache {
    routed_shape: (usize, usize, usize),
    capsules: Array3<f32>,
    lengths: Array2<f32>,
    class_output: Array2<f32>,
    selector: Array2<f32>,
}

/// Métriques par époque, nommées d'après les sorties qu'elles mesurent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub loss: Vec<f32>,
    pub capsnet_loss: Vec<f32>,
    pub out_recon_loss: Vec<f32>,
    pub capsnet_acc: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_capsnet_loss: Vec<f32>,
    pub val_out_recon_loss: Vec<f32>,
    pub val_capsnet_acc: Vec<f32>,
    pub lr: Vec<f32>,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    fn record(&mut self, train: &EpochMetrics, validation: Option<&EpochMetrics>) {
        self.loss.push(train.loss);
        self.capsnet_loss.push(train.capsnet_loss);
        self.out_recon_loss.push(train.recon_loss);
        self.capsnet_acc.push(train.accuracy);
        if let Some(val) = validation {
            self.val_loss.push(val.loss);
            self.val_capsnet_loss.push(val.capsnet_loss);
            self.val_out_recon_loss.push(val.recon_loss);
            self.val_capsnet_acc.push(val.accuracy);
        }
    }
}

/// Moyennes pondérées par échantillon sur un passage du dataset.
#[derive(Debug, Clone, Copy, Default)]
struct EpochMetrics {
    loss: f32,
    capsnet_loss: f32,
    recon_loss: f32,
    accuracy: f32,
    samples: usize,
}

impl EpochMetrics {
    fn add(&mut self, batch_size: usize, total: f32, capsnet: f32, recon: f32, correct: f32) {
        let n = batch_size as f32;
        self.loss += total * n;
        self.capsnet_loss += capsnet * n;
        self.recon_loss += recon * n;
        self.accuracy += correct;
        self.samples += batch_size;
    }

    fn finish(mut self) -> Self {
        let n = self.samples.max(1) as f32;
        self.loss /= n;
        self.capsnet_loss /= n;
        self.recon_loss /= n;
        self.accuracy /= n;
        self
    }
}

/// Arrête l'entraînement quand `val_capsnet_loss` ne s'améliore plus pendant `patience` époques.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    pub best: f32,
    pub wait: usize,
    pub stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            wait: 0,
            stopped_epoch: None,
        }
    }

    /// Vrai quand l'entraînement doit s'arrêter après `epoch`.
    pub fn on_epoch_end(&mut self, epoch: usize, monitored: f32) -> bool {
        if monitored < self.best {
            self.best = monitored;
            self.wait = 0;
        } else {
            self.wait += 1;
            if self.wait >= self.patience {
                self.stopped_epoch = Some(epoch);
                return true;
            }
        }
        false
    }
}

fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(len))
}

/// Softmax par ligne des longueurs de capsules.
fn softmax_rows(lengths: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = lengths.to_owned();
    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        row /= sum;
    }
    result
}

fn softmax_rows_backward(probs: &ArrayView2<f32>, grad_probs: &ArrayView2<f32>) -> Array2<f32> {
    let dots = (probs * grad_probs).sum_axis(Axis(1)).insert_axis(Axis(1));
    let centered = grad_probs - &dots;
    &centered * probs
}

impl CapsNet {
    pub fn new(
        network_config: NetworkConfig,
        feature_layers: Vec<Box<dyn SequenceLayer>>,
        primary: PrimaryCapsLayer,
        digit: DigitCapsLayer,
        decoder: Decoder,
    ) -> Self {
        Self {
            network_config,
            feature_layers,
            primary,
            digit,
            decoder,
            cache: None,
        }
    }

    pub fn n_class(&self) -> usize {
        self.digit.num_capsule()
    }

    pub fn dim_capsule(&self) -> usize {
        self.digit.dim_capsule()
    }

    fn check_inputs(&self, x: &ArrayView3<f32>, y: Option<&ArrayView2<f32>>) -> Result<()> {
        let (batch_size, length, channels) = x.dim();
        if (length, channels) != self.network_config.input_shape {
            let (l, c) = self.network_config.input_shape;
            return Err(CapsError::shape("model input", &[l, c], &[length, channels]));
        }
        if let Some(y) = y {
            if y.dim() != (batch_size, self.n_class()) {
                return Err(CapsError::shape(
                    "model labels",
                    &[batch_size, self.n_class()],
                    y.shape(),
                ));
            }
        }
        Ok(())
    }

    /// Couches de features, capsules primaires et routing : `(N, L, C)` → `(N, n_class, dim + n_in)`.
    fn encode(&mut self, x: &ArrayView3<f32>, mode: Mode) -> Result<Array3<f32>> {
        let mut hidden = x.to_owned();
        for layer in &mut self.feature_layers {
            hidden = layer.forward(&hidden.view(), mode)?;
        }
        let primary = self.primary.forward(&hidden.view(), mode)?;
        self.digit.forward(&primary.view(), mode)
    }

    fn class_output(&self, lengths: &ArrayView2<f32>) -> Array2<f32> {
        match self.network_config.class_activation {
            Activation::Softmax => softmax_rows(lengths),
            _ => lengths.to_owned(),
        }
    }

    /// Scores de classe et reconstruction, décodeur masqué par les vrais labels.
    pub fn train_forward(
        &mut self,
        x: &ArrayView3<f32>,
        y: &ArrayView2<f32>,
        mode: Mode,
    ) -> Result<(Array2<f32>, Array3<f32>)> {
        self.check_inputs(x, Some(y))?;
        let routed = self.encode(x, mode)?;
        let capsules = extract_outputs(&routed.view(), self.dim_capsule())?;
        let lengths = capsule_length(&capsules.view());
        let class_output = self.class_output(&lengths.view());
        // Masquage par les vrais labels
        let masked = mask(&capsules.view(), y)?;
        let reconstruction = self.decoder.forward(&masked.view())?;

        // Cache pour backward
        self.cache = Some(ForwardCache {
            routed_shape: routed.dim(),
            capsules,
            lengths,
            class_output: class_output.clone(),
            selector: y.to_owned(),
        });
        Ok((class_output, reconstruction))
    }

    /// Inférence par batchs, le décodeur voit la capsule la plus longue de chaque échantillon.
    pub fn evaluate(
        &mut self,
        x: &ArrayView3<f32>,
        batch_size: usize,
    ) -> Result<(Array2<f32>, Array3<f32>)> {
        self.check_inputs(x, None)?;
        self.cache = None;
        let (n, length, channels) = x.dim();
        let mut class_output = Array2::zeros((n, self.n_class()));
        let mut reconstruction = Array3::zeros((n, length, channels));

        for range in batch_ranges(n, batch_size) {
            let batch = x.slice(s![range.clone(), .., ..]);
            let routed = self.encode(&batch, Mode::Eval)?;
            let capsules = extract_outputs(&routed.view(), self.dim_capsule())?;
            let lengths = capsule_length(&capsules.view());
            let selector = longest_capsule_selector(&capsules.view());
            let masked = mask(&capsules.view(), &selector.view())?;
            let recon = self.decoder.forward(&masked.view())?;

            class_output
                .slice_mut(s![range.clone(), ..])
                .assign(&self.class_output(&lengths.view()));
            reconstruction.slice_mut(s![range, .., ..]).assign(&recon);
        }
        Ok((class_output, reconstruction))
    }

    /// Reconstruction de `mask(capsules + noise, y)`, `noise` est `(N, n_class, dim)`.
    pub fn manipulate(
        &mut self,
        x: &ArrayView3<f32>,
        y: &ArrayView2<f32>,
        noise: &ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        self.check_inputs(x, Some(y))?;
        let expected = (x.dim().0, self.n_class(), self.dim_capsule());
        if noise.dim() != expected {
            return Err(CapsError::shape(
                "capsule noise",
                &[expected.0, expected.1, expected.2],
                noise.shape(),
            ));
        }
        self.cache = None;
        let routed = self.encode(x, Mode::Eval)?;
        let capsules = extract_outputs(&routed.view(), self.dim_capsule())? + noise;
        let masked = mask(&capsules.view(), y)?;
        self.decoder.forward(&masked.view())
    }

    /// Coefficients de couplage du dernier tour, `(N, n_class, n_primary_capsules)`.
    pub fn coupling_coefficients(
        &mut self,
        x: &ArrayView3<f32>,
        batch_size: usize,
    ) -> Result<Array3<f32>> {
        self.check_inputs(x, None)?;
        self.cache = None;
        let n = x.dim().0;
        let mut coefficients =
            Array3::zeros((n, self.n_class(), self.digit.input_num_capsule()));
        for range in batch_ranges(n, batch_size) {
            let routed = self.encode(&x.slice(s![range.clone(), .., ..]), Mode::Eval)?;
            coefficients
                .slice_mut(s![range, .., ..])
                .assign(&extract_weight_c(&routed.view(), self.dim_capsule())?);
        }
        Ok(coefficients)
    }

    /// Accumule les gradients des paramètres à partir des deux gradients de sortie de `train_forward`.
    pub fn backward(
        &mut self,
        grad_class: &ArrayView2<f32>,
        grad_reconstruction: &ArrayView3<f32>,
    ) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or(CapsError::MissingForward("capsnet"))?;
        if grad_class.dim() != cache.class_output.dim() {
            return Err(CapsError::shape(
                "class output gradient",
                cache.class_output.shape(),
                grad_class.shape(),
            ));
        }
        let dim = self.dim_capsule();

        // Gradient venant du décodeur
        let grad_masked = self.decoder.backward(grad_reconstruction)?;
        let mut grad_capsules = mask_backward(&grad_masked.view(), &cache.selector.view(), dim)?;

        // Gradient venant de la sortie de classe, à travers le softmax éventuel
        let grad_lengths = match self.network_config.class_activation {
            Activation::Softmax => softmax_rows_backward(&cache.class_output.view(), grad_class),
            _ => grad_class.to_owned(),
        };
        grad_capsules += &capsule_length_backward(
            &cache.capsules.view(),
            &cache.lengths.view(),
            &grad_lengths.view(),
        );

        let grad_routed = extract_backward(
            Some(&grad_capsules.view()),
            None,
            cache.routed_shape,
            dim,
        )?;
        // Routing, capsules primaires puis couches de features
        let grad_primary = self.digit.backward(&grad_routed.view())?;
        let mut grad = self.primary.backward(&grad_primary.view())?;
        for layer in self.feature_layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }
        Ok(())
    }

    /// Entraîne sur `(x, y)` et valide sur `validation` après chaque époque.
    pub fn fit(
        &mut self,
        x: &ArrayView3<f32>,
        y: &ArrayView2<f32>,
        validation: Option<(&ArrayView3<f32>, &ArrayView2<f32>)>,
        config: &TrainingConfig,
        optimizer: &mut dyn Optimizer,
    ) -> Result<History> {
        self.check_inputs(x, Some(y))?;
        if let Some((val_x, val_y)) = validation {
            self.check_inputs(val_x, Some(val_y))?;
        }
        let num_samples = x.dim().0;
        if num_samples == 0 {
            return Err(CapsError::Data("training set is empty".into()));
        }

        let loss_kind = config.capsule_loss_kind();
        let loss = CombinedLoss::new(loss_kind, &config.loss_config, config.lam_recon);
        let accuracy_kind = AccuracyKind::for_loss(loss_kind);
        let scheduler = LRScheduler::exponential(config.lr, config.lrdecay);
        let mut lr_monitor = LearningRateMonitor::default();
        let mut early_stopping = config.earlystop.map(EarlyStopping::new);
        if early_stopping.is_some() && validation.is_none() {
            warn!("early stopping requires validation data; it is disabled for this run");
            early_stopping = None;
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut order: Vec<usize> = (0..num_samples).collect();
        let mut history = History::default();
        let epochs = config.epoch_limit(early_stopping.is_some());

        info!(
            samples = num_samples,
            parameters = self.parameter_count(),
            validation = validation.map(|(vx, _)| vx.dim().0).unwrap_or(0),
            epochs,
            batch_size = config.batch_size,
            loss = ?loss_kind,
            "starting training"
        );
        lr_monitor.on_train_begin();

        for epoch in 0..epochs {
            scheduler.on_epoch_begin(epoch, optimizer);
            order.shuffle(&mut rng);

            let mut train = EpochMetrics::default();
            for chunk in order.chunks(config.batch_size.max(1)) {
                let batch_x = x.select(Axis(0), chunk);
                let batch_y = y.select(Axis(0), chunk);
                let weights = match &config.class_weight {
                    Some(class_weight) => Some(sample_weights(&batch_y.view(), class_weight)?),
                    None => None,
                };
                let weight_view = weights.as_ref().map(|w| w.view());

                // Forward, loss, backward puis mise à jour
                let (class_output, reconstruction) =
                    self.train_forward(&batch_x.view(), &batch_y.view(), Mode::Train)?;
                let breakdown = loss.evaluate(
                    &batch_y.view(),
                    &class_output.view(),
                    &batch_x.view(),
                    &reconstruction.view(),
                    weight_view.as_ref(),
                )?;
                self.backward(
                    &breakdown.grad_class.view(),
                    &breakdown.grad_reconstruction.view(),
                )?;
                apply_gradients(optimizer, self);

                train.add(
                    chunk.len(),
                    breakdown.total,
                    breakdown.capsnet,
                    breakdown.reconstruction,
                    correct_count(accuracy_kind, &batch_y.view(), &class_output.view()),
                );
            }
            let train = train.finish();

            // Validation avec le décodeur masqué par les labels
            let val = match validation {
                Some((val_x, val_y)) => Some(self.score(
                    val_x,
                    val_y,
                    &loss,
                    accuracy_kind,
                    config.batch_size,
                )?),
                None => None,
            };

            lr_monitor.on_epoch_end(optimizer);
            history.record(&train, val.as_ref());
            history.lr.push(lr_monitor.learning_rate);

            match &val {
                Some(v) => info!(
                    epoch = epoch + 1,
                    loss = train.loss,
                    capsnet_acc = train.accuracy,
                    val_loss = v.loss,
                    val_capsnet_loss = v.capsnet_loss,
                    val_capsnet_acc = v.accuracy,
                    "epoch finished"
                ),
                None => info!(
                    epoch = epoch + 1,
                    loss = train.loss,
                    capsnet_loss = train.capsnet_loss,
                    out_recon_loss = train.recon_loss,
                    capsnet_acc = train.accuracy,
                    "epoch finished"
                ),
            }

            if let (Some(stopper), Some(v)) = (early_stopping.as_mut(), val.as_ref()) {
                if stopper.on_epoch_end(epoch, v.capsnet_loss) {
                    info!(
                        epoch = epoch + 1,
                        best_val_capsnet_loss = stopper.best,
                        "early stopping"
                    );
                    break;
                }
            }
        }

        Ok(history)
    }

    /// Loss et accuracy non pondérées, décodeur masqué par les labels.
    fn score(
        &mut self,
        x: &ArrayView3<f32>,
        y: &ArrayView2<f32>,
        loss: &CombinedLoss,
        accuracy_kind: AccuracyKind,
        batch_size: usize,
    ) -> Result<EpochMetrics> {
        let mut metrics = EpochMetrics::default();
        for range in batch_ranges(x.dim().0, batch_size) {
            let batch_x = x.slice(s![range.clone(), .., ..]);
            let batch_y = y.slice(s![range.clone(), ..]);
            let (class_output, reconstruction) =
                self.train_forward(&batch_x, &batch_y, Mode::Eval)?;
            let breakdown = loss.evaluate(
                &batch_y,
                &class_output.view(),
                &batch_x,
                &reconstruction.view(),
                None,
            )?;
            metrics.add(
                range.len(),
                breakdown.total,
                breakdown.capsnet,
                breakdown.reconstruction,
                correct_count(accuracy_kind, &batch_y, &class_output.view()),
            );
        }
        self.cache = None;
        Ok(metrics.finish())
    }

    /// Classe la plus probable par échantillon.
    pub fn predict_classes(&mut self, x: &ArrayView3<f32>, batch_size: usize) -> Result<Vec<usize>> {
        let (class_output, _) = self.evaluate(x, batch_size)?;
        Ok(class_output.outer_iter().map(|row| argmax(&row)).collect())
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }
}

impl Layer for CapsNet {
    fn name(&self) -> &str {
        "capsnet"
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut params: Vec<_> = self
            .feature_layers
            .iter()
            .flat_map(|l| l.parameters())
            .collect();
        params.extend(self.primary.parameters());
        params.extend(self.digit.parameters());
        params.extend(self.decoder.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        let mut params: Vec<_> = self
            .feature_layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect();
        params.extend(self.primary.parameters_mut());
        params.extend(self.digit.parameters_mut());
        params.extend(self.decoder.parameters_mut());
        params
    }

    fn zero_grad(&mut self) {
        self.feature_layers.iter_mut().for_each(|l| l.zero_grad());
        self.primary.zero_grad();
        self.digit.zero_grad();
        self.decoder.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::ModelBuilder;
    use crate::model::config::{
        CapsuleConfig, DecoderConfig, DigitCapsConfig, LayerConfig, RoutingGradient,
    };
    use crate::model::optimizer::Adam;
    use approx::assert_abs_diff_eq;

    fn tiny_config(class_activation: Activation) -> NetworkConfig {
        NetworkConfig {
            input_shape: (8, 4),
            n_class: 2,
            feature_layers: vec![
                LayerConfig::Conv1d {
                    filters: 6,
                    kernel_size: 3,
                    stride: 1,
                    activation: Activation::ReLU,
                },
                LayerConfig::Dropout { rate: 0.2 },
            ],
            primary_caps: CapsuleConfig {
                dim_capsule: 4,
                n_channels: 2,
                kernel_size: 3,
                stride: 1,
                dropout: 0.0,
            },
            digit_caps: DigitCapsConfig {
                dim_capsule: 5,
                routings: 3,
                dropout: 0.0,
                gradient: RoutingGradient::Full,
            },
            decoder: DecoderConfig {
                hidden_units: vec![12],
            },
            class_activation,
            seed: 3,
        }
    }

    fn tiny_batch(n: usize) -> (Array3<f32>, Array2<f32>) {
        let x = Array3::from_shape_fn((n, 8, 4), |(b, l, c)| {
            if (b + l) % 4 == c {
                1.0
            } else {
                0.0
            }
        });
        let y = Array2::from_shape_fn((n, 2), |(b, k)| if b % 2 == k { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn entry_points_have_expected_shapes() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let (x, y) = tiny_batch(5);

        let (class_output, recon) = model.train_forward(&x.view(), &y.view(), Mode::Train).unwrap();
        assert_eq!(class_output.dim(), (5, 2));
        assert_eq!(recon.dim(), (5, 8, 4));

        let (class_output, recon) = model.evaluate(&x.view(), 2).unwrap();
        assert_eq!(class_output.dim(), (5, 2));
        assert_eq!(recon.dim(), (5, 8, 4));
        assert!(class_output.iter().all(|&v| (0.0..1.0).contains(&v)));

        // (8 - 3 + 1) = 6, (6 - 3 + 1) = 4 positions × 2 canaux
        let coupling = model.coupling_coefficients(&x.view(), 2).unwrap();
        assert_eq!(coupling.dim(), (5, 2, 8));
        for sample in coupling.outer_iter() {
            for column in sample.axis_iter(Axis(1)) {
                assert_abs_diff_eq!(column.sum(), 1.0, epsilon = 1e-5);
            }
        }

        let noise = Array3::from_elem((5, 2, 5), 0.05);
        let manipulated = model.manipulate(&x.view(), &y.view(), &noise.view()).unwrap();
        assert_eq!(manipulated.dim(), (5, 8, 4));
    }

    #[test]
    fn softmax_class_output_sums_to_one() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Softmax))
            .build()
            .unwrap();
        let (x, _) = tiny_batch(3);
        let (class_output, _) = model.evaluate(&x.view(), 8).unwrap();
        for row in class_output.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn rejects_wrong_input_and_noise_shapes() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let bad = Array3::zeros((2, 7, 4));
        assert!(matches!(
            model.evaluate(&bad.view(), 2),
            Err(CapsError::Shape { .. })
        ));

        let (x, y) = tiny_batch(2);
        let noise = Array3::zeros((2, 2, 4));
        assert!(model.manipulate(&x.view(), &y.view(), &noise.view()).is_err());
    }

    #[test]
    fn backward_requires_forward() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let result = model.backward(&Array2::zeros((1, 2)).view(), &Array3::zeros((1, 8, 4)).view());
        assert!(matches!(result, Err(CapsError::MissingForward(_))));
    }

    #[test]
    fn inference_discards_pending_training_forward() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let (x, y) = tiny_batch(4);
        let noise = Array3::zeros((4, 2, 5));
        let grad_class = Array2::zeros((4, 2));
        let grad_recon = Array3::zeros((4, 8, 4));

        for entry in 0..3 {
            model.train_forward(&x.view(), &y.view(), Mode::Train).unwrap();
            match entry {
                0 => {
                    model.evaluate(&x.view(), 2).unwrap();
                }
                1 => {
                    model.coupling_coefficients(&x.view(), 2).unwrap();
                }
                _ => {
                    model.manipulate(&x.view(), &y.view(), &noise.view()).unwrap();
                }
            }
            let result = model.backward(&grad_class.view(), &grad_recon.view());
            assert!(matches!(result, Err(CapsError::MissingForward(_))));
        }
    }

    #[test]
    fn predicted_class_has_the_longest_capsule() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let (x, _) = tiny_batch(6);
        let (class_output, _) = model.evaluate(&x.view(), 4).unwrap();
        let classes = model.predict_classes(&x.view(), 4).unwrap();
        assert_eq!(classes.len(), 6);
        for (row, &k) in class_output.outer_iter().zip(&classes) {
            assert!(row.iter().all(|&v| v <= row[k]));
        }
    }

    #[test]
    fn softmax_backward_matches_finite_differences() {
        let logits = Array2::from_shape_vec((1, 3), vec![0.2, -0.4, 0.9]).unwrap();
        let upstream = Array2::from_shape_vec((1, 3), vec![1.0, -2.0, 0.5]).unwrap();
        let probs = softmax_rows(&logits.view());
        let analytic = softmax_rows_backward(&probs.view(), &upstream.view());

        let h = 1e-3;
        for k in 0..3 {
            let mut plus = logits.clone();
            plus[[0, k]] += h;
            let mut minus = logits.clone();
            minus[[0, k]] -= h;
            let f = |l: &Array2<f32>| (&softmax_rows(&l.view()) * &upstream).sum();
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(analytic[[0, k]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut stopper = EarlyStopping::new(2);
        assert!(!stopper.on_epoch_end(0, 1.0));
        assert!(!stopper.on_epoch_end(1, 0.8));
        assert!(!stopper.on_epoch_end(2, 0.9));
        assert!(stopper.on_epoch_end(3, 0.85));
        assert_eq!(stopper.stopped_epoch, Some(3));
        assert_abs_diff_eq!(stopper.best, 0.8);
    }

    #[test]
    fn fit_records_history_per_epoch() {
        let mut model = ModelBuilder::new()
            .with_network_config(tiny_config(Activation::Linear))
            .build()
            .unwrap();
        let (x, y) = tiny_batch(12);
        let (val_x, val_y) = tiny_batch(4);
        let config = TrainingConfig {
            nb_epoch: 3,
            batch_size: 4,
            lr: 0.01,
            lrdecay: 0.9,
            ..TrainingConfig::default()
        };
        let mut optimizer = Adam::new(config.lr, 0.9, 0.999, 1e-8);

        let history = model
            .fit(
                &x.view(),
                &y.view(),
                Some((&val_x.view(), &val_y.view())),
                &config,
                &mut optimizer,
            )
            .unwrap();
        assert_eq!(history.epochs(), 3);
        assert_eq!(history.val_capsnet_loss.len(), 3);
        assert!(history.loss.iter().all(|l| l.is_finite()));
        assert_abs_diff_eq!(history.lr[2], 0.01 * 0.81, epsilon = 1e-7);
        assert_eq!(optimizer.iterations(), 9);
    }
}
