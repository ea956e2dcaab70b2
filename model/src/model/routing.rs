use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

use super::config::RoutingGradient;
use super::layers::{squash, squash_backward};

/// Routing par accord entre les vecteurs de prédiction d'un échantillon et les capsules de sortie.
///
/// Prédictions en `(output_caps, input_caps, dim)`, coefficients de couplage
/// en `(output_caps, input_caps)`. Le softmax porte sur les capsules de
/// sortie : chaque capsule d'entrée distribue une unité de couplage.
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    pub num_iterations: usize,
    pub gradient: RoutingGradient,
}

/// État de chaque tour de routing, gardé pour le backward.
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    coupling: Vec<Array2<f32>>,
    weighted: Vec<Array2<f32>>,
    outputs: Vec<Array2<f32>>,
}

impl RoutingTrace {
    /// Capsules de sortie du dernier tour après squash, `(output_caps, dim)`.
    pub fn output(&self) -> ArrayView2<'_, f32> {
        self.outputs[self.outputs.len() - 1].view()
    }

    /// Coefficients de couplage du dernier tour, `(output_caps, input_caps)`.
    pub fn coupling(&self) -> ArrayView2<'_, f32> {
        self.coupling[self.coupling.len() - 1].view()
    }
}

impl DynamicRouting {
    pub fn new(num_iterations: usize, gradient: RoutingGradient) -> Self {
        Self {
            num_iterations: num_iterations.max(1),
            gradient,
        }
    }

    pub fn route(&self, predictions: &ArrayView3<f32>) -> RoutingTrace {
        let (output_caps, input_caps, _) = predictions.dim();
        let mut logits = Array2::<f32>::zeros((output_caps, input_caps));
        let mut trace = RoutingTrace {
            coupling: Vec::with_capacity(self.num_iterations),
            weighted: Vec::with_capacity(self.num_iterations),
            outputs: Vec::with_capacity(self.num_iterations),
        };

        for iteration in 0..self.num_iterations {
            let coupling = softmax_over_outputs(&logits.view());
            let weighted = weighted_sum(predictions, &coupling.view());
            let outputs = squash(&weighted.view());

            if iteration + 1 < self.num_iterations {
                for (j, mut row) in logits.axis_iter_mut(Axis(0)).enumerate() {
                    let agreement = predictions
                        .index_axis(Axis(0), j)
                        .dot(&outputs.row(j));
                    row += &agreement;
                }
            }

            trace.coupling.push(coupling);
            trace.weighted.push(weighted);
            trace.outputs.push(outputs);
        }

        trace
    }

    /// Gradient par rapport aux prédictions.
    ///
    /// `grad_coupling` est le gradient amont sur les coefficients de couplage
    /// finaux, ignoré quand le gradient du routing est arrêté.
    pub fn backward(
        &self,
        predictions: &ArrayView3<f32>,
        trace: &RoutingTrace,
        grad_output: &ArrayView2<f32>,
        grad_coupling: &ArrayView2<f32>,
    ) -> Array3<f32> {
        match self.gradient {
            RoutingGradient::Stop => self.backward_stopped(predictions, trace, grad_output),
            RoutingGradient::Full => {
                self.backward_full(predictions, trace, grad_output, grad_coupling)
            }
        }
    }

    fn backward_stopped(
        &self,
        predictions: &ArrayView3<f32>,
        trace: &RoutingTrace,
        grad_output: &ArrayView2<f32>,
    ) -> Array3<f32> {
        let last = self.num_iterations - 1;
        let grad_weighted = squash_backward(&trace.weighted[last].view(), grad_output);
        let mut grad_predictions = Array3::zeros(predictions.raw_dim());
        accumulate_outer(
            &mut grad_predictions,
            &trace.coupling[last].view(),
            &grad_weighted.view(),
        );
        grad_predictions
    }

    fn backward_full(
        &self,
        predictions: &ArrayView3<f32>,
        trace: &RoutingTrace,
        grad_output: &ArrayView2<f32>,
        grad_coupling: &ArrayView2<f32>,
    ) -> Array3<f32> {
        let (output_caps, input_caps, dim) = predictions.dim();
        let last = self.num_iterations - 1;
        let mut grad_predictions = Array3::zeros(predictions.raw_dim());
        // dL/d logits du tour suivant
        let mut grad_logits = Array2::<f32>::zeros((output_caps, input_caps));

        for round in (0..self.num_iterations).rev() {
            let coupling = &trace.coupling[round];
            let outputs = &trace.outputs[round];

            let mut grad_outputs = if round == last {
                grad_output.to_owned()
            } else {
                Array2::zeros((output_caps, dim))
            };

            if round < last {
                // Accord : logits[r + 1] = logits[r] + <outputs[r], predictions>
                for j in 0..output_caps {
                    let preds_j = predictions.index_axis(Axis(0), j);
                    let mut grad_v = grad_outputs.row_mut(j);
                    grad_v += &grad_logits.row(j).dot(&preds_j);
                }
                accumulate_outer(&mut grad_predictions, &grad_logits.view(), &outputs.view());
            }

            let grad_weighted = squash_backward(&trace.weighted[round].view(), &grad_outputs.view());
            accumulate_outer(&mut grad_predictions, &coupling.view(), &grad_weighted.view());

            let mut grad_c = if round == last {
                grad_coupling.to_owned()
            } else {
                Array2::zeros((output_caps, input_caps))
            };
            for j in 0..output_caps {
                let preds_j = predictions.index_axis(Axis(0), j);
                let mut row = grad_c.row_mut(j);
                row += &preds_j.dot(&grad_weighted.row(j));
            }

            grad_logits += &softmax_backward(&coupling.view(), &grad_c.view());
        }

        grad_predictions
    }
}

/// Softmax par colonne, donc sur les capsules de sortie.
fn softmax_over_outputs(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();
    for mut column in result.axis_iter_mut(Axis(1)) {
        let max_val = column.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        column.mapv_inplace(|v| (v - max_val).exp());
        let sum = column.sum();
        column /= sum;
    }
    result
}

fn softmax_backward(coupling: &ArrayView2<f32>, grad_coupling: &ArrayView2<f32>) -> Array2<f32> {
    let weighted = coupling * grad_coupling;
    let dots = weighted.sum_axis(Axis(0));
    let centered = grad_coupling - &dots;
    &centered * coupling
}

/// `s_j = Σ_i c_ji û_ji`
fn weighted_sum(predictions: &ArrayView3<f32>, coupling: &ArrayView2<f32>) -> Array2<f32> {
    let (output_caps, _, dim) = predictions.dim();
    let mut weighted = Array2::zeros((output_caps, dim));
    for (j, mut row) in weighted.axis_iter_mut(Axis(0)).enumerate() {
        row.assign(&coupling.row(j).dot(&predictions.index_axis(Axis(0), j)));
    }
    weighted
}

/// `target[j] += left[j]ᵀ ⊗ right[j]` pour chaque capsule de sortie `j`.
fn accumulate_outer(
    target: &mut Array3<f32>,
    left: &ArrayView2<f32>,
    right: &ArrayView2<f32>,
) {
    for (j, mut slab) in target.axis_iter_mut(Axis(0)).enumerate() {
        let column: ArrayView2<f32> = left.row(j).insert_axis(Axis(1));
        let row_vec: ArrayView1<f32> = right.row(j);
        general_mat_mul(1.0, &column, &row_vec.insert_axis(Axis(0)), 1.0, &mut slab);
    }
}
