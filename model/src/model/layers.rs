use ndarray::{
    s, Array, Array1, Array2, Array3, ArrayD, ArrayView, ArrayView2, ArrayView3, ArrayViewD,
    ArrayViewMutD, Axis, Dimension, ShapeBuilder, Zip,
};
use ndarray_rand::rand_distr::{Distribution, Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{CapsError, Result};
use crate::model::config::{conv_output_length, Activation};

/// Facteur de stabilité numérique pour squash, longueur et clipping.
pub const EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Tenseur entraînable et son gradient accumulé.
pub struct Param<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// Trait pour tout ce qui porte des paramètres nommés
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;
    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)>;
    fn parameters_mut(&mut self) -> Vec<Param<'_>>;
    fn zero_grad(&mut self);
}

/// Couches sur des batchs de séquences canaux en dernier `(N, L, C)`.
pub trait SequenceLayer: Layer {
    fn forward(&mut self, input: &ArrayView3<f32>, mode: Mode) -> Result<Array3<f32>>;
    fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>>;
}

/// Initialisation He : normale tronquée, σ = sqrt(2 / fan_in), retirée au-delà de 2σ.
pub fn he_normal<Sh, D>(shape: Sh, fan_in: usize, rng: &mut StdRng) -> Result<Array<f32, D>>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    let normal = Normal::new(0.0, std)
        .map_err(|e| CapsError::Config(format!("invalid initializer: {}", e)))?;
    let limit = 2.0 * std;
    let mut weights = Array::random_using(shape, normal, rng);
    weights.mapv_inplace(|mut v| {
        while v.abs() > limit {
            v = normal.sample(rng);
        }
        v
    });
    Ok(weights)
}

/// Initialisation Glorot : `U(-limit, limit)` avec `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    Array::random_using((fan_in, fan_out), Uniform::new_inclusive(-limit, limit), rng)
}

fn check_activation(activation: Activation) -> Result<()> {
    if activation == Activation::Softmax {
        return Err(CapsError::Config(
            "softmax is only supported on the class output".into(),
        ));
    }
    Ok(())
}

fn activate<D: Dimension>(x: Array<f32, D>, activation: Activation) -> Array<f32, D> {
    match activation {
        Activation::ReLU => x.mapv_into(|v| v.max(0.0)),
        Activation::Sigmoid => x.mapv_into(|v| 1.0 / (1.0 + (-v).exp())),
        Activation::Linear | Activation::Softmax => x,
    }
}

/// Gradient à travers l'activation, exprimé à partir de sa sortie.
fn activation_backward<D: Dimension>(
    output: &Array<f32, D>,
    grad_output: &ArrayView<f32, D>,
    activation: Activation,
) -> Array<f32, D> {
    let mut grad = grad_output.to_owned();
    match activation {
        Activation::ReLU => Zip::from(&mut grad).and(output).for_each(|g, &o| {
            if o <= 0.0 {
                *g = 0.0;
            }
        }),
        Activation::Sigmoid => Zip::from(&mut grad)
            .and(output)
            .for_each(|g, &o| *g *= o * (1.0 - o)),
        Activation::Linear | Activation::Softmax => {}
    }
    grad
}

/// Convolution 1D "valid" avec backpropagation
pub struct Conv1d {
    name: String,
    /// `(kernel_size * in_channels, filters)`, ligne `k * in_channels + c`.
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub in_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub activation: Activation,

    input_cache: Option<Array3<f32>>,
    output_cache: Option<Array3<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl Conv1d {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self> {
        check_activation(activation)?;
        let fan_in = kernel_size * in_channels;
        let weights = he_normal((fan_in, filters), fan_in, rng)?;

        Ok(Self {
            name: name.into(),
            weight_grad: Array2::zeros(weights.dim()),
            weights,
            biases: Array1::zeros(filters),
            bias_grad: Array1::zeros(filters),
            in_channels,
            kernel_size,
            stride,
            activation,
            input_cache: None,
            output_cache: None,
        })
    }

    pub fn filters(&self) -> usize {
        self.weights.ncols()
    }

    fn output_length(&self, length: usize) -> Result<usize> {
        conv_output_length(length, self.kernel_size, self.stride).ok_or_else(|| {
            CapsError::shape(
                format!("{} input length", self.name),
                &[self.kernel_size],
                &[length],
            )
        })
    }

    /// im2col : chaque champ récepteur devient une ligne `(N * L_out, kernel_size * C)`.
    fn im2col(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>> {
        let (batch_size, length, channels) = input.dim();
        if channels != self.in_channels {
            return Err(CapsError::shape(
                format!("{} input channels", self.name),
                &[self.in_channels],
                &[channels],
            ));
        }
        let out_len = self.output_length(length)?;
        let mut patches = Array2::zeros((batch_size * out_len, self.kernel_size * channels));

        patches
            .axis_chunks_iter_mut(Axis(0), out_len.max(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut rows)| {
                for t in 0..out_len {
                    let start = t * self.stride;
                    for k in 0..self.kernel_size {
                        rows.slice_mut(s![t, k * channels..(k + 1) * channels])
                            .assign(&input.slice(s![b, start + k, ..]));
                    }
                }
            });

        Ok(patches)
    }

    /// col2im : replie les gradients des patchs sur les positions d'entrée.
    fn col2im(&self, grad_patches: &Array2<f32>, batch_size: usize, length: usize) -> Array3<f32> {
        let channels = self.in_channels;
        let out_len = grad_patches.nrows() / batch_size.max(1);
        let mut grad_input = Array3::zeros((batch_size, length, channels));

        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut sample)| {
                for t in 0..out_len {
                    let start = t * self.stride;
                    let row = grad_patches.row(b * out_len + t);
                    for k in 0..self.kernel_size {
                        let mut position = sample.row_mut(start + k);
                        position += &row.slice(s![k * channels..(k + 1) * channels]);
                    }
                }
            });

        grad_input
    }
}

impl Layer for Conv1d {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        vec![
            (format!("{}/kernel", self.name), self.weights.view().into_dyn()),
            (format!("{}/bias", self.name), self.biases.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: format!("{}/kernel", self.name),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            Param {
                name: format!("{}/bias", self.name),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

impl SequenceLayer for Conv1d {
    fn forward(&mut self, input: &ArrayView3<f32>, _mode: Mode) -> Result<Array3<f32>> {
        let (batch_size, length, _) = input.dim();
        let out_len = self.output_length(length)?;
        let patches = self.im2col(input)?;

        // Convolution sous forme de produit matriciel, puis activation
        let pre_activation = patches.dot(&self.weights) + &self.biases;
        let output = activate(pre_activation, self.activation)
            .into_shape_with_order((batch_size, out_len, self.filters()))?;

        // Cache pour backward
        self.input_cache = Some(input.to_owned());
        self.output_cache = Some(output.clone());
        Ok(output)
    }

    fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("conv1d"))?;
        let output = self
            .output_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("conv1d"))?;
        if grad_output.dim() != output.dim() {
            return Err(CapsError::shape(
                format!("{} gradient", self.name),
                output.shape(),
                grad_output.shape(),
            ));
        }

        let (batch_size, length, _) = input.dim();
        let (_, out_len, filters) = output.dim();
        // Gradient à travers l'activation
        let grad = activation_backward(output, grad_output, self.activation)
            .into_shape_with_order((batch_size * out_len, filters))?;

        // Gradient des poids et biais
        let patches = self.im2col(&input.view())?;
        self.weight_grad += &patches.t().dot(&grad);
        self.bias_grad += &grad.sum_axis(Axis(0));

        // Gradient par rapport à l'entrée (pour la couche précédente)
        let grad_patches = grad.dot(&self.weights.t());
        Ok(self.col2im(&grad_patches, batch_size, length))
    }
}

/// Dropout inversé : les unités gardées sont multipliées par `1 / (1 - rate)` en entraînement.
pub struct Dropout {
    name: String,
    pub rate: f32,
    rng: StdRng,
    mask: Option<ArrayD<f32>>,
}

impl Dropout {
    pub fn new(name: impl Into<String>, rate: f32, seed: u64) -> Self {
        Self {
            name: name.into(),
            rate,
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        }
    }

    pub fn apply<D: Dimension>(&mut self, input: Array<f32, D>, mode: Mode) -> Array<f32, D> {
        if mode == Mode::Eval || self.rate <= 0.0 {
            self.mask = None;
            return input;
        }

        let keep_scale = 1.0 / (1.0 - self.rate);
        let rate = self.rate;
        let mask = Array::random_using(input.raw_dim(), Uniform::new(0.0f32, 1.0), &mut self.rng)
            .mapv_into(|u| if u >= rate { keep_scale } else { 0.0 });
        let output = input * &mask;
        self.mask = Some(mask.into_dyn());
        output
    }

    pub fn apply_backward<D: Dimension>(&self, grad_output: Array<f32, D>) -> Result<Array<f32, D>> {
        match &self.mask {
            None => Ok(grad_output),
            Some(mask) => {
                let mask = mask.view().into_dimensionality::<D>()?;
                if mask.shape() != grad_output.shape() {
                    return Err(CapsError::shape(
                        format!("{} gradient", self.name),
                        mask.shape(),
                        grad_output.shape(),
                    ));
                }
                Ok(grad_output * &mask)
            }
        }
    }
}

impl Layer for Dropout {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    fn zero_grad(&mut self) {}
}

impl SequenceLayer for Dropout {
    fn forward(&mut self, input: &ArrayView3<f32>, mode: Mode) -> Result<Array3<f32>> {
        Ok(self.apply(input.to_owned(), mode))
    }

    fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        self.apply_backward(grad_output.to_owned())
    }
}

/// Couche dense sur `(N, features)`.
pub struct Dense {
    name: String,
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,

    input_cache: Option<Array2<f32>>,
    output_cache: Option<Array2<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl Dense {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        units: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self> {
        check_activation(activation)?;
        let weights = glorot_uniform(input_dim, units, rng);
        Ok(Self {
            name: name.into(),
            weight_grad: Array2::zeros(weights.dim()),
            weights,
            biases: Array1::zeros(units),
            bias_grad: Array1::zeros(units),
            activation,
            input_cache: None,
            output_cache: None,
        })
    }

    pub fn forward(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.weights.nrows() {
            return Err(CapsError::shape(
                format!("{} input", self.name),
                &[self.weights.nrows()],
                &[input.ncols()],
            ));
        }
        let output = activate(input.dot(&self.weights) + &self.biases, self.activation);
        self.input_cache = Some(input.to_owned());
        self.output_cache = Some(output.clone());
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("dense"))?;
        let output = self
            .output_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("dense"))?;
        if grad_output.dim() != output.dim() {
            return Err(CapsError::shape(
                format!("{} gradient", self.name),
                output.shape(),
                grad_output.shape(),
            ));
        }

        let grad = activation_backward(output, grad_output, self.activation);
        self.weight_grad += &input.t().dot(&grad);
        self.bias_grad += &grad.sum_axis(Axis(0));
        Ok(grad.dot(&self.weights.t()))
    }
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        vec![
            (format!("{}/kernel", self.name), self.weights.view().into_dyn()),
            (format!("{}/bias", self.name), self.biases.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: format!("{}/kernel", self.name),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            Param {
                name: format!("{}/bias", self.name),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

/// `|s|² / (1 + |s|²) / |s|` pour une norme au carré `q`.
fn squash_scale(q: f32) -> f32 {
    q / (1.0 + q) / (q + EPSILON).sqrt()
}

/// Dérivée de [`squash_scale`] par rapport à `q`.
fn squash_scale_derivative(q: f32) -> f32 {
    let r = (q + EPSILON).sqrt();
    (r - q * (1.0 + q) / (2.0 * r)) / ((1.0 + q).powi(2) * r * r)
}

/// Fonction squash pour capsules, sur le dernier axe
pub fn squash<D: Dimension>(vectors: &ArrayView<f32, D>) -> Array<f32, D> {
    let last = Axis(vectors.ndim() - 1);
    let mut result = vectors.to_owned();
    Zip::from(result.lanes_mut(last)).par_for_each(|mut lane| {
        let q = lane.dot(&lane);
        lane *= squash_scale(q);
    });
    result
}

/// Gradient de [`squash`] à partir de son entrée.
pub fn squash_backward<D: Dimension>(
    vectors: &ArrayView<f32, D>,
    grad_output: &ArrayView<f32, D>,
) -> Array<f32, D> {
    let last = Axis(vectors.ndim() - 1);
    let mut grad_input = Array::zeros(vectors.raw_dim());
    Zip::from(grad_input.lanes_mut(last))
        .and(vectors.lanes(last))
        .and(grad_output.lanes(last))
        .par_for_each(|mut gs, v, gv| {
            let q = v.dot(&v);
            let scale = squash_scale(q);
            let projected = 2.0 * squash_scale_derivative(q) * gv.dot(&v);
            Zip::from(&mut gs)
                .and(&v)
                .and(&gv)
                .for_each(|g, &x, &dy| *g = scale * dy + projected * x);
        });
    grad_input
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn squash_keeps_direction_and_bounds_length() {
        let v = array![[3.0f32, 4.0], [0.0, 0.0]];
        let out = squash(&v.view());
        // |s| = 5 -> 25 / 26
        let norm = (out[[0, 0]].powi(2) + out[[0, 1]].powi(2)).sqrt();
        assert_abs_diff_eq!(norm, 25.0 / 26.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 0]] / out[[0, 1]], 0.75, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[1, 0]], 0.0);
    }

    #[test]
    fn squash_backward_matches_finite_differences() {
        let v = array![[0.3f32, -0.5, 0.8, 0.1], [1.2, 0.4, -0.7, 0.05]];
        let upstream = array![[0.2f32, -0.1, 0.4, 0.3], [-0.6, 0.5, 0.1, 0.2]];
        let analytic = squash_backward(&v.view(), &upstream.view());

        let h = 1e-3;
        for idx in [[0, 0], [0, 2], [1, 1], [1, 3]] {
            let mut plus = v.clone();
            plus[idx] += h;
            let mut minus = v.clone();
            minus[idx] -= h;
            let f_plus = (&squash(&plus.view()) * &upstream).sum();
            let f_minus = (&squash(&minus.view()) * &upstream).sum();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert_abs_diff_eq!(analytic[idx], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn conv1d_valid_output_length_and_values() {
        let mut conv = Conv1d::new("conv", 2, 1, 3, 1, Activation::Linear, &mut rng()).unwrap();
        conv.weights.fill(1.0);
        conv.biases.fill(0.5);

        let input = Array3::from_shape_fn((1, 5, 2), |(_, t, c)| (t * 2 + c) as f32);
        let output = conv.forward(&input.view(), Mode::Eval).unwrap();
        assert_eq!(output.dim(), (1, 3, 1));
        // fenêtre [0..3) : 0+1+2+3+4+5 = 15
        assert_abs_diff_eq!(output[[0, 0, 0]], 15.5);
        assert_abs_diff_eq!(output[[0, 2, 0]], (4..10).sum::<usize>() as f32 + 0.5);
    }

    #[test]
    fn conv1d_rejects_short_sequences() {
        let mut conv = Conv1d::new("conv", 2, 4, 9, 1, Activation::ReLU, &mut rng()).unwrap();
        let input = Array3::zeros((2, 5, 2));
        assert!(matches!(
            conv.forward(&input.view(), Mode::Train),
            Err(CapsError::Shape { .. })
        ));
    }

    #[test]
    fn conv1d_input_gradient_matches_finite_differences() {
        let mut conv = Conv1d::new("conv", 2, 3, 2, 2, Activation::Sigmoid, &mut rng()).unwrap();
        let input = Array3::from_shape_fn((2, 5, 2), |(b, t, c)| {
            0.1 * (b as f32 + 1.0) * (t as f32 - 2.0) + 0.05 * c as f32
        });
        let output = conv.forward(&input.view(), Mode::Train).unwrap();
        let upstream = Array3::from_shape_fn(output.dim(), |(b, t, f)| {
            0.3 - 0.1 * (b + t + f) as f32
        });
        let grad_input = conv.backward(&upstream.view()).unwrap();

        let h = 1e-3;
        for idx in [[0, 0, 0], [0, 3, 1], [1, 2, 0], [1, 4, 1]] {
            let mut plus = input.clone();
            plus[idx] += h;
            let mut minus = input.clone();
            minus[idx] -= h;
            let f_plus = (&conv.forward(&plus.view(), Mode::Eval).unwrap() * &upstream).sum();
            let f_minus = (&conv.forward(&minus.view(), Mode::Eval).unwrap() * &upstream).sum();
            assert_abs_diff_eq!(grad_input[idx], (f_plus - f_minus) / (2.0 * h), epsilon = 1e-2);
        }
    }

    #[test]
    fn dense_accumulates_weight_gradients() {
        let mut dense = Dense::new("dense", 2, 1, Activation::Linear, &mut rng()).unwrap();
        let input = array![[1.0f32, 2.0], [3.0, 4.0]];
        dense.forward(&input.view()).unwrap();
        dense.backward(&array![[1.0f32], [1.0]].view()).unwrap();

        let params = dense.parameters_mut();
        assert_abs_diff_eq!(params[0].grad[&[0, 0][..]], 4.0);
        assert_abs_diff_eq!(params[0].grad[&[1, 0][..]], 6.0);
        assert_abs_diff_eq!(params[1].grad[&[0][..]], 2.0);
    }

    #[test]
    fn dropout_is_identity_in_eval_and_scales_in_train() {
        let mut dropout = Dropout::new("drop", 0.5, 3);
        let input = Array3::<f32>::ones((4, 8, 8));
        let eval = dropout.apply(input.clone(), Mode::Eval);
        assert_eq!(eval, input);

        let train = dropout.apply(input.clone(), Mode::Train);
        assert!(train.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        let grad = dropout.apply_backward(Array3::ones((4, 8, 8))).unwrap();
        assert_eq!(grad, train);
    }

    #[test]
    fn dense_weights_stay_within_glorot_limit() {
        let dense = Dense::new("dense", 30, 6, Activation::ReLU, &mut rng()).unwrap();
        let limit = (6.0f32 / 36.0).sqrt();
        assert!(dense.weights.iter().all(|v| v.abs() <= limit));
        assert!(dense.weights.iter().any(|v| v.abs() > 0.5 * limit));
        assert!(dense.biases.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn he_normal_is_truncated() {
        let w: Array2<f32> = he_normal((50, 40), 8, &mut rng()).unwrap();
        let limit = 2.0 * (2.0f32 / 8.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));
    }
}
