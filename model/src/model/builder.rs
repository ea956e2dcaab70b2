use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::capsule::{DigitCapsLayer, PrimaryCapsLayer};
use super::config::{LayerConfig, ModelType, NetworkConfig};
use super::core::CapsNet;
use super::decoder::Decoder;
use super::layers::{Conv1d, Dropout, SequenceLayer};
use crate::error::{CapsError, Result};

/// Constructeur du modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn build(self) -> Result<CapsNet> {
        let config = self
            .network_config
            .ok_or_else(|| CapsError::Config("a network configuration is required".into()))?;
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let (feature_layers, channels) = Self::build_feature_layers(&config, &mut rng)?;

        let caps = &config.primary_caps;
        let primary = PrimaryCapsLayer::new(
            channels,
            caps.dim_capsule,
            caps.n_channels,
            caps.kernel_size,
            caps.stride,
            caps.dropout,
            &mut rng,
            config.seed.wrapping_add(1_000),
        )?;

        let digit_config = &config.digit_caps;
        let digit = DigitCapsLayer::new(
            config.primary_capsule_count()?,
            caps.dim_capsule,
            config.n_class,
            digit_config.dim_capsule,
            digit_config.routings,
            digit_config.gradient,
            digit_config.dropout,
            &mut rng,
            config.seed.wrapping_add(2_000),
        )?;

        let decoder = Decoder::new(
            config.n_class * digit_config.dim_capsule,
            &config.decoder.hidden_units,
            config.input_shape,
            &mut rng,
        )?;

        debug!(
            feature_layers = feature_layers.len(),
            primary_capsules = digit.input_num_capsule(),
            n_class = config.n_class,
            "model built"
        );
        Ok(CapsNet::new(config, feature_layers, primary, digit, decoder))
    }

    /// Renvoie les couches et le nombre de canaux qu'elles produisent.
    fn build_feature_layers(
        config: &NetworkConfig,
        rng: &mut StdRng,
    ) -> Result<(Vec<Box<dyn SequenceLayer>>, usize)> {
        let mut layers: Vec<Box<dyn SequenceLayer>> = Vec::new();
        let mut channels = config.input_shape.1;
        let (mut convs, mut dropouts) = (0, 0);

        for layer_config in &config.feature_layers {
            let layer: Box<dyn SequenceLayer> = match layer_config {
                LayerConfig::Conv1d {
                    filters,
                    kernel_size,
                    stride,
                    activation,
                } => {
                    convs += 1;
                    let conv = Conv1d::new(
                        format!("conv1d_{}", convs),
                        channels,
                        *filters,
                        *kernel_size,
                        *stride,
                        *activation,
                        rng,
                    )?;
                    channels = *filters;
                    Box::new(conv)
                }
                LayerConfig::Dropout { rate } => {
                    dropouts += 1;
                    Box::new(Dropout::new(
                        format!("dropout_{}", dropouts),
                        *rate,
                        config.seed.wrapping_add(dropouts as u64),
                    ))
                }
            };
            layers.push(layer);
        }

        Ok((layers, channels))
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Construit une architecture prédéfinie à partir du nom de son type.
pub fn capsnet(
    input_shape: (usize, usize),
    n_class: usize,
    routings: usize,
    model_type: &str,
) -> Result<CapsNet> {
    let model_type: ModelType = model_type.parse()?;
    ModelBuilder::new()
        .with_network_config(NetworkConfig::preset(model_type, input_shape, n_class, routings))
        .build()
}
