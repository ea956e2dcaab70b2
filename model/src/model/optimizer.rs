use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::HashMap;
use tracing::debug;

use super::config::OptimizerType;
use super::layers::Layer;

/// Trait pour les optimiseurs
pub trait Optimizer: Send + Sync {
    /// Début d'une mise à jour, appelé une fois par batch avant les `step`.
    fn begin_iteration(&mut self);
    fn step(&mut self, param_id: &str, param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>);
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
    fn iterations(&self) -> usize;

    /// Learning rate après la décroissance par itération.
    fn effective_lr(&self) -> f32 {
        self.get_lr()
    }
}

pub fn build_optimizer(kind: OptimizerType, learning_rate: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerType::Adam {
            beta1,
            beta2,
            epsilon,
            decay,
        } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon).with_decay(decay)),
        OptimizerType::Sgd { momentum } => Box::new(SGD::new(learning_rate, momentum)),
    }
}

/// Applique tous les gradients accumulés de `model` puis les remet à zéro.
pub fn apply_gradients(optimizer: &mut dyn Optimizer, model: &mut dyn Layer) {
    optimizer.begin_iteration();
    for param in model.parameters_mut() {
        optimizer.step(&param.name, param.value, param.grad);
    }
    model.zero_grad();
}

/// Optimiseur SGD avec momentum
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    iterations: usize,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            iterations: 0,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn begin_iteration(&mut self) {
        self.iterations += 1;
    }

    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let velocity = self
            .velocity
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        // Vélocité : v = momentum * v - lr * grad, puis param += v
        let (momentum, lr) = (self.momentum, self.learning_rate);
        Zip::from(&mut param)
            .and(velocity)
            .and(&grad)
            .for_each(|p, v, &g| {
                *v = momentum * *v - lr * g;
                *p += *v;
            });
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn iterations(&self) -> usize {
        self.iterations
    }
}

/// Optimiseur Adam
///
/// La correction du biais est intégrée au pas et ε est ajouté hors de la
/// racine : `p -= lr_t · m / (sqrt(v) + ε)` avec
/// `lr_t = lr · sqrt(1 − β2^t) / (1 − β1^t)`.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    decay: f32,
    iterations: usize,

    // Moments du premier ordre (mean)
    m: HashMap<String, ArrayD<f32>>,

    // Moments du second ordre (variance)
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            decay: 0.0,
            iterations: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    fn decayed_lr(&self, iterations: usize) -> f32 {
        self.learning_rate / (1.0 + self.decay * iterations as f32)
    }
}

impl Optimizer for Adam {
    fn begin_iteration(&mut self) {
        self.iterations += 1;
    }

    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let t = self.iterations.max(1);
        let lr = self.decayed_lr(t - 1);
        let lr_t = lr * (1.0 - self.beta2.powi(t as i32)).sqrt() / (1.0 - self.beta1.powi(t as i32));

        let m = self
            .m
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
        let v = self
            .v
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        Zip::from(&mut param)
            .and(m)
            .and(v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + epsilon);
            });
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn effective_lr(&self) -> f32 {
        self.decayed_lr(self.iterations)
    }
}

/// Planning exponentiel par époque : `lr(epoch) = initial_lr · decay^epoch`.
#[derive(Debug, Clone, Copy)]
pub struct LRScheduler {
    pub initial_lr: f32,
    pub decay: f32,
}

impl LRScheduler {
    pub fn exponential(initial_lr: f32, decay: f32) -> Self {
        Self { initial_lr, decay }
    }

    pub fn lr_for_epoch(&self, epoch: usize) -> f32 {
        self.initial_lr * self.decay.powi(epoch as i32)
    }

    pub fn on_epoch_begin(&self, epoch: usize, optimizer: &mut dyn Optimizer) {
        let lr = self.lr_for_epoch(epoch);
        if (lr - optimizer.get_lr()).abs() > f32::EPSILON * lr.abs().max(1.0) {
            debug!(epoch, lr, "learning rate updated");
        }
        optimizer.set_lr(lr);
    }
}

/// Enregistre le learning rate effectif à la fin de chaque époque.
#[derive(Debug, Clone, Default)]
pub struct LearningRateMonitor {
    pub learning_rate: f32,
    pub history: Vec<f32>,
}

impl LearningRateMonitor {
    pub fn on_train_begin(&mut self) {
        self.learning_rate = 0.0;
        self.history.clear();
    }

    pub fn on_epoch_end(&mut self, optimizer: &dyn Optimizer) {
        self.learning_rate = optimizer.effective_lr();
        self.history.push(self.learning_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::ArrayD;
    use ndarray::IxDyn;

    #[test]
    fn test_sgd_momentum() {
        let mut optimizer = SGD::new(0.1, 0.9);
        let mut param = ArrayD::<f32>::ones(IxDyn(&[2, 2]));
        let grad = ArrayD::<f32>::ones(IxDyn(&[2, 2]));

        optimizer.begin_iteration();
        optimizer.step("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[&[0, 0][..]], 0.9, epsilon = 1e-6);

        // v = 0.9 * -0.1 - 0.1 = -0.19
        optimizer.begin_iteration();
        optimizer.step("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[&[0, 0][..]], 0.71, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
        let mut param = ArrayD::<f32>::ones(IxDyn(&[3]));
        let grad = ArrayD::from_elem(IxDyn(&[3]), 0.5f32);

        optimizer.begin_iteration();
        optimizer.step("w", param.view_mut(), grad.view());
        // le premier pas corrigé vaut lr quelle que soit l'échelle du gradient
        assert_abs_diff_eq!(param[&[0][..]], 1.0 - 0.001, epsilon = 1e-5);
    }

    #[test]
    fn adam_decay_lowers_effective_rate() {
        let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8).with_decay(0.5);
        assert_abs_diff_eq!(optimizer.effective_lr(), 0.01);
        optimizer.begin_iteration();
        optimizer.begin_iteration();
        assert_abs_diff_eq!(optimizer.effective_lr(), 0.005, epsilon = 1e-7);
    }

    #[test]
    fn exponential_schedule() {
        let scheduler = LRScheduler::exponential(0.001, 0.5);
        assert_abs_diff_eq!(scheduler.lr_for_epoch(0), 0.001);
        assert_abs_diff_eq!(scheduler.lr_for_epoch(3), 0.000125, epsilon = 1e-9);

        let mut optimizer = SGD::new(1.0, 0.0);
        scheduler.on_epoch_begin(2, &mut optimizer);
        assert_abs_diff_eq!(optimizer.get_lr(), 0.00025, epsilon = 1e-9);
    }

    #[test]
    fn monitor_records_each_epoch() {
        let mut monitor = LearningRateMonitor::default();
        let optimizer = Adam::new(0.002, 0.9, 0.999, 1e-8);
        monitor.on_train_begin();
        monitor.on_epoch_end(&optimizer);
        monitor.on_epoch_end(&optimizer);
        assert_eq!(monitor.history, vec![0.002, 0.002]);
    }
}
