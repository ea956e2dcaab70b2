use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewD};
use rand::rngs::StdRng;

use super::config::Activation;
use super::layers::{Dense, Layer, Param};
use crate::error::{CapsError, Result};

/// Décodeur : reconstruit la séquence d'entrée à partir des capsules masquées.
///
/// Couches cachées en ReLU, dernière couche sigmoïde sur `L * C` unités
/// remises en forme `(L, C)`.
pub struct Decoder {
    layers: Vec<Dense>,
    output_shape: (usize, usize),
}

impl Decoder {
    pub fn new(
        input_dim: usize,
        hidden_units: &[usize],
        output_shape: (usize, usize),
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(hidden_units.len() + 1);
        let mut fan_in = input_dim;
        for (i, &units) in hidden_units.iter().enumerate() {
            layers.push(Dense::new(
                format!("decoder/dense_{}", i + 1),
                fan_in,
                units,
                Activation::ReLU,
                rng,
            )?);
            fan_in = units;
        }
        layers.push(Dense::new(
            format!("decoder/dense_{}", hidden_units.len() + 1),
            fan_in,
            output_shape.0 * output_shape.1,
            Activation::Sigmoid,
            rng,
        )?);

        Ok(Self {
            layers,
            output_shape,
        })
    }

    pub fn forward(&mut self, masked: &ArrayView2<f32>) -> Result<Array3<f32>> {
        let batch_size = masked.nrows();
        let mut hidden = masked.to_owned();
        for layer in &mut self.layers {
            hidden = layer.forward(&hidden.view())?;
        }
        let (length, channels) = self.output_shape;
        Ok(hidden.into_shape_with_order((batch_size, length, channels))?)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array2<f32>> {
        let (batch_size, length, channels) = grad_output.dim();
        if (length, channels) != self.output_shape {
            return Err(CapsError::shape(
                "reconstruction gradient",
                &[self.output_shape.0, self.output_shape.1],
                &[length, channels],
            ));
        }
        let mut grad = grad_output
            .to_owned()
            .into_shape_with_order((batch_size, length * channels))?;
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }
        Ok(grad)
    }
}

impl Layer for Decoder {
    fn name(&self) -> &str {
        "decoder"
    }

    fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<Param<'_>> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }

    fn zero_grad(&mut self) {
        self.layers.iter_mut().for_each(|l| l.zero_grad());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn reconstruction_has_input_shape_and_unit_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut decoder = Decoder::new(20, &[16, 32], (7, 3), &mut rng).unwrap();
        let masked = Array2::from_elem((4, 20), 0.3);
        let recon = decoder.forward(&masked.view()).unwrap();
        assert_eq!(recon.dim(), (4, 7, 3));
        assert!(recon.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let grad = decoder.backward(&Array3::ones((4, 7, 3)).view()).unwrap();
        assert_eq!(grad.dim(), (4, 20));
        assert_eq!(decoder.parameters().len(), 6);
    }
}
