use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayViewD, Axis, Zip};
use rand::rngs::StdRng;
use rayon::prelude::*;

use super::config::{Activation, RoutingGradient};
use super::layers::{
    he_normal, squash, squash_backward, Conv1d, Dropout, Layer, Mode, Param, SequenceLayer,
    EPSILON,
};
use super::routing::{DynamicRouting, RoutingTrace};
use crate::error::{CapsError, Result};

/// Capsules primaires : convolution linéaire, dropout, regroupement en vecteurs puis squash.
pub struct PrimaryCapsLayer {
    pub conv: Conv1d,
    dropout: Dropout,
    pub dim_capsule: usize,
    pub n_channels: usize,
    pre_squash: Option<Array3<f32>>,
}

impl PrimaryCapsLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        dim_capsule: usize,
        n_channels: usize,
        kernel_size: usize,
        stride: usize,
        dropout: f32,
        rng: &mut StdRng,
        seed: u64,
    ) -> Result<Self> {
        let conv = Conv1d::new(
            "primarycap_conv1d",
            in_channels,
            dim_capsule * n_channels,
            kernel_size,
            stride,
            Activation::Linear,
            rng,
        )?;

        Ok(Self {
            conv,
            dropout: Dropout::new("primarycap_dropout", dropout, seed),
            dim_capsule,
            n_channels,
            pre_squash: None,
        })
    }

    /// `(N, L, C)` → `(N, L_out * n_channels, dim_capsule)`
    pub fn forward(&mut self, input: &ArrayView3<f32>, mode: Mode) -> Result<Array3<f32>> {
        let features = self.conv.forward(input, mode)?;
        let features = self.dropout.apply(features, mode);
        let (batch_size, out_len, _) = features.dim();

        let capsules = features
            .into_shape_with_order((batch_size, out_len * self.n_channels, self.dim_capsule))?;
        let output = squash(&capsules.view());
        self.pre_squash = Some(capsules);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let capsules = self
            .pre_squash
            .as_ref()
            .ok_or(CapsError::MissingForward("primary capsules"))?;
        if grad_output.dim() != capsules.dim() {
            return Err(CapsError::shape(
                "primary capsule gradient",
                capsules.shape(),
                grad_output.shape(),
            ));
        }

        let (batch_size, num_caps, _) = capsules.dim();
        let out_len = num_caps / self.n_channels;
        let grad = squash_backward(&capsules.view(), grad_output).into_shape_with_order((
            batch_size,
            out_len,
            self.n_channels * self.dim_capsule,
        ))?;
        let grad = self.dropout.apply_backward(grad)?;
        self.conv.backward(&grad.view())
    }
}

impl Layer for PrimaryCapsLayer {
    fn name(&self) -> &str {
        "primarycap"
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        self.conv.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        self.conv.parameters_mut()
    }

    fn zero_grad(&mut self) {
        self.conv.zero_grad();
    }
}

/// Couche de capsules avec routing dynamique
///
/// La sortie concatène chaque vecteur de capsule avec les coefficients de couplage
/// reçus : `(N, num_capsule, dim_capsule + input_num_capsule)`. Utiliser
/// [`extract_outputs`] et [`extract_weight_c`] pour les séparer.
pub struct DigitCapsLayer {
    name: String,
    /// `(num_capsule, input_num_capsule, dim_capsule, input_dim_capsule)`
    pub weights: Array4<f32>,
    pub routing: DynamicRouting,
    dropout: Dropout,

    weight_grad: Array4<f32>,
    input_cache: Option<Array3<f32>>,
    predictions_cache: Option<Array4<f32>>,
    traces: Vec<RoutingTrace>,
}

impl DigitCapsLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_num_capsule: usize,
        input_dim_capsule: usize,
        num_capsule: usize,
        dim_capsule: usize,
        routings: usize,
        gradient: RoutingGradient,
        dropout: f32,
        rng: &mut StdRng,
        seed: u64,
    ) -> Result<Self> {
        // fan-in 4D : avant-dernier axe × champ récepteur des axes de tête
        let weights = he_normal(
            (num_capsule, input_num_capsule, dim_capsule, input_dim_capsule),
            dim_capsule * num_capsule * input_num_capsule,
            rng,
        )?;

        Ok(Self {
            name: "digitcaps".to_string(),
            weight_grad: Array4::zeros(weights.dim()),
            weights,
            routing: DynamicRouting::new(routings, gradient),
            dropout: Dropout::new("digitcaps_dropout", dropout, seed),
            input_cache: None,
            predictions_cache: None,
            traces: Vec::new(),
        })
    }

    pub fn num_capsule(&self) -> usize {
        self.weights.dim().0
    }

    pub fn input_num_capsule(&self) -> usize {
        self.weights.dim().1
    }

    pub fn dim_capsule(&self) -> usize {
        self.weights.dim().2
    }

    pub fn forward(&mut self, input: &ArrayView3<f32>, mode: Mode) -> Result<Array3<f32>> {
        let (num_caps, input_caps, dim, input_dim) = self.weights.dim();
        let (batch_size, got_caps, got_dim) = input.dim();
        if (got_caps, got_dim) != (input_caps, input_dim) {
            return Err(CapsError::shape(
                "digit capsule input",
                &[input_caps, input_dim],
                &[got_caps, got_dim],
            ));
        }

        // Prédictions : û[b, j, i] = W[j, i] · u[b, i]
        let mut predictions = Array4::zeros((batch_size, num_caps, input_caps, dim));
        let weights = &self.weights;
        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut sample)| {
                let u = input.index_axis(Axis(0), b);
                for j in 0..num_caps {
                    for i in 0..input_caps {
                        let w = weights.slice(s![j, i, .., ..]);
                        sample.slice_mut(s![j, i, ..]).assign(&w.dot(&u.row(i)));
                    }
                }
            });
        let predictions = self.dropout.apply(predictions, mode);

        // Routing parallélisé par échantillon
        let routing = &self.routing;
        let traces: Vec<RoutingTrace> = predictions
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|sample| routing.route(&sample))
            .collect();

        let mut output = Array3::zeros((batch_size, num_caps, dim + input_caps));
        for (b, trace) in traces.iter().enumerate() {
            output.slice_mut(s![b, .., ..dim]).assign(&trace.output());
            output.slice_mut(s![b, .., dim..]).assign(&trace.coupling());
        }

        // Cache pour backward
        self.input_cache = Some(input.to_owned());
        self.predictions_cache = Some(predictions);
        self.traces = traces;
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("digit capsules"))?;
        let predictions = self
            .predictions_cache
            .as_ref()
            .ok_or(CapsError::MissingForward("digit capsules"))?;
        let (num_caps, input_caps, dim, input_dim) = self.weights.dim();
        let batch_size = input.dim().0;
        if grad_output.dim() != (batch_size, num_caps, dim + input_caps) {
            return Err(CapsError::shape(
                "digit capsule gradient",
                &[batch_size, num_caps, dim + input_caps],
                grad_output.shape(),
            ));
        }

        // Gradient à travers le routing, échantillon par échantillon
        let mut grad_predictions = Array4::zeros(predictions.raw_dim());
        let routing = &self.routing;
        let traces = &self.traces;
        grad_predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut sample)| {
                let grad = grad_output.index_axis(Axis(0), b);
                sample.assign(&routing.backward(
                    &predictions.index_axis(Axis(0), b),
                    &traces[b],
                    &grad.slice(s![.., ..dim]),
                    &grad.slice(s![.., dim..]),
                ));
            });
        let grad_predictions = self.dropout.apply_backward(grad_predictions)?;

        // Gradient des poids : dW[j, i] += Σ_b ĝ[b, j, i] ⊗ u[b, i]
        self.weight_grad
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(j, mut grad_w)| {
                for i in 0..input_caps {
                    let g = grad_predictions.slice(s![.., j, i, ..]);
                    let u = input.slice(s![.., i, ..]);
                    let mut target = grad_w.index_axis_mut(Axis(0), i);
                    general_mat_mul(1.0, &g.t(), &u, 1.0, &mut target);
                }
            });

        // Gradient par rapport à l'entrée (pour la couche précédente)
        let mut grad_input = Array3::zeros((batch_size, input_caps, input_dim));
        let weights = &self.weights;
        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut sample)| {
                for i in 0..input_caps {
                    let mut row = sample.row_mut(i);
                    for j in 0..num_caps {
                        let w = weights.slice(s![j, i, .., ..]);
                        row += &w.t().dot(&grad_predictions.slice(s![b, j, i, ..]));
                    }
                }
            });

        Ok(grad_input)
    }
}

impl Layer for DigitCapsLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        vec![(format!("{}/W", self.name), self.weights.view().into_dyn())]
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        vec![Param {
            name: format!("{}/W", self.name),
            value: self.weights.view_mut().into_dyn(),
            grad: self.weight_grad.view().into_dyn(),
        }]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
    }
}

fn check_split(routed: &ArrayView3<f32>, dim: usize) -> Result<()> {
    let width = routed.dim().2;
    if dim > width {
        return Err(CapsError::shape("capsule split", &[dim], &[width]));
    }
    Ok(())
}

/// `x[:, :, :dim]`, les vecteurs de capsules d'une sortie routée.
pub fn extract_outputs(routed: &ArrayView3<f32>, dim: usize) -> Result<Array3<f32>> {
    check_split(routed, dim)?;
    Ok(routed.slice(s![.., .., ..dim]).to_owned())
}

/// `x[:, :, dim:]`, les coefficients de couplage d'une sortie routée.
pub fn extract_weight_c(routed: &ArrayView3<f32>, dim: usize) -> Result<Array3<f32>> {
    check_split(routed, dim)?;
    Ok(routed.slice(s![.., .., dim..]).to_owned())
}

/// Réassemble les gradients des deux moitiés sur toute la largeur routée.
pub fn extract_backward(
    grad_outputs: Option<&ArrayView3<f32>>,
    grad_weight_c: Option<&ArrayView3<f32>>,
    shape: (usize, usize, usize),
    dim: usize,
) -> Result<Array3<f32>> {
    let (batch_size, num_caps, width) = shape;
    let mut grad = Array3::zeros(shape);
    if let Some(g) = grad_outputs {
        if g.dim() != (batch_size, num_caps, dim) {
            return Err(CapsError::shape(
                "extracted outputs gradient",
                &[batch_size, num_caps, dim],
                g.shape(),
            ));
        }
        grad.slice_mut(s![.., .., ..dim]).assign(g);
    }
    if let Some(g) = grad_weight_c {
        if g.dim() != (batch_size, num_caps, width - dim) {
            return Err(CapsError::shape(
                "extracted coupling gradient",
                &[batch_size, num_caps, width - dim],
                g.shape(),
            ));
        }
        grad.slice_mut(s![.., .., dim..]).assign(g);
    }
    Ok(grad)
}

/// Longueur des capsules `sqrt(Σ v² + ε)` : `(N, n, d)` → `(N, n)`.
pub fn capsule_length(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules
        .map_axis(Axis(2), |v| (v.dot(&v) + EPSILON).sqrt())
}

pub fn capsule_length_backward(
    capsules: &ArrayView3<f32>,
    lengths: &ArrayView2<f32>,
    grad_lengths: &ArrayView2<f32>,
) -> Array3<f32> {
    let mut grad = capsules.to_owned();
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(lengths)
        .and(grad_lengths)
        .for_each(|mut v, &len, &g| v *= g / len);
    grad
}

/// One-hot de la capsule la plus longue, à égalité l'indice le plus bas.
pub fn longest_capsule_selector(capsules: &ArrayView3<f32>) -> Array2<f32> {
    let lengths = capsule_length(capsules);
    let mut selector = Array2::zeros(lengths.raw_dim());
    for (mut row, len) in selector.outer_iter_mut().zip(lengths.outer_iter()) {
        let mut best = 0;
        for (k, &value) in len.iter().enumerate() {
            if value > len[best] {
                best = k;
            }
        }
        if !len.is_empty() {
            row[best] = 1.0;
        }
    }
    selector
}

/// Masque les capsules avec `selector` et les aplatit en `(N, n * d)`.
pub fn mask(capsules: &ArrayView3<f32>, selector: &ArrayView2<f32>) -> Result<Array2<f32>> {
    let (batch_size, num_caps, dim) = capsules.dim();
    if selector.dim() != (batch_size, num_caps) {
        return Err(CapsError::shape(
            "mask selector",
            &[batch_size, num_caps],
            selector.shape(),
        ));
    }
    let masked = capsules * &selector.view().insert_axis(Axis(2));
    Ok(masked.into_shape_with_order((batch_size, num_caps * dim))?)
}

pub fn mask_backward(
    grad_masked: &ArrayView2<f32>,
    selector: &ArrayView2<f32>,
    dim: usize,
) -> Result<Array3<f32>> {
    let (batch_size, num_caps) = selector.dim();
    let grad = grad_masked
        .to_owned()
        .into_shape_with_order((batch_size, num_caps, dim))?;
    Ok(grad * &selector.view().insert_axis(Axis(2)))
}
