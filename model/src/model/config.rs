use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CapsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    ReLU,
    Sigmoid,
    Softmax,
    Linear,
}

/// Chemin du gradient à travers les itérations de routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingGradient {
    /// Backpropagation à travers chaque tour, softmax et accord compris.
    Full,
    /// Couplage constant, seule la somme pondérée finale porte le gradient.
    Stop,
}

/// Les deux architectures prédéfinies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "nogradientstop")]
    NoGradientStop,
    #[serde(rename = "nogradientstop_crossentropy")]
    NoGradientStopCrossEntropy,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::NoGradientStop => "nogradientstop",
            ModelType::NoGradientStopCrossEntropy => "nogradientstop_crossentropy",
        }
    }

    pub fn uses_cross_entropy(&self) -> bool {
        matches!(self, ModelType::NoGradientStopCrossEntropy)
    }
}

impl FromStr for ModelType {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nogradientstop" => Ok(ModelType::NoGradientStop),
            "nogradientstop_crossentropy" => Ok(ModelType::NoGradientStopCrossEntropy),
            other => Err(CapsError::UnknownModelType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerConfig {
    Conv1d {
        filters: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

/// Capsules primaires : convolution linéaire regroupée en vecteurs de capsules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub dim_capsule: usize,
    pub n_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub dropout: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitCapsConfig {
    pub dim_capsule: usize,
    pub routings: usize,
    pub dropout: f32,
    pub gradient: RoutingGradient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub hidden_units: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `(longueur, canaux)` d'une séquence d'entrée.
    pub input_shape: (usize, usize),
    pub n_class: usize,
    pub feature_layers: Vec<LayerConfig>,
    pub primary_caps: CapsuleConfig,
    pub digit_caps: DigitCapsConfig,
    pub decoder: DecoderConfig,
    /// `Linear` donne les longueurs brutes, `Softmax` les normalise.
    pub class_activation: Activation,
    pub seed: u64,
}

impl NetworkConfig {
    pub fn preset(
        model_type: ModelType,
        input_shape: (usize, usize),
        n_class: usize,
        routings: usize,
    ) -> Self {
        let (second_dropout, class_activation) = match model_type {
            ModelType::NoGradientStop => (0.7, Activation::Linear),
            ModelType::NoGradientStopCrossEntropy => (0.75, Activation::Softmax),
        };

        Self {
            input_shape,
            n_class,
            feature_layers: vec![
                LayerConfig::Conv1d {
                    filters: 200,
                    kernel_size: 1,
                    stride: 1,
                    activation: Activation::ReLU,
                },
                LayerConfig::Dropout { rate: 0.7 },
                LayerConfig::Conv1d {
                    filters: 200,
                    kernel_size: 9,
                    stride: 1,
                    activation: Activation::ReLU,
                },
                LayerConfig::Dropout {
                    rate: second_dropout,
                },
            ],
            primary_caps: CapsuleConfig {
                dim_capsule: 8,
                n_channels: 60,
                kernel_size: 20,
                stride: 1,
                dropout: 0.2,
            },
            digit_caps: DigitCapsConfig {
                dim_capsule: 10,
                routings,
                dropout: 0.1,
                gradient: RoutingGradient::Full,
            },
            decoder: DecoderConfig {
                hidden_units: vec![512, 1024],
            },
            class_activation,
            seed: 7,
        }
    }

    /// Longueur de séquence et nombre de canaux après les couches de features.
    pub fn feature_shape(&self) -> Result<(usize, usize)> {
        let (mut length, mut channels) = self.input_shape;
        for (i, layer) in self.feature_layers.iter().enumerate() {
            if let LayerConfig::Conv1d {
                filters,
                kernel_size,
                stride,
                ..
            } = layer
            {
                length = conv_output_length(length, *kernel_size, *stride)
                    .ok_or_else(|| {
                        CapsError::Config(format!(
                            "feature layer {} (kernel {}) does not fit a sequence of length {}",
                            i, kernel_size, length
                        ))
                    })?;
                channels = *filters;
            }
        }
        Ok((length, channels))
    }

    /// Nombre de capsules primaires en entrée du routing.
    pub fn primary_capsule_count(&self) -> Result<usize> {
        let (length, _) = self.feature_shape()?;
        let caps = &self.primary_caps;
        let out_len = conv_output_length(length, caps.kernel_size, caps.stride).ok_or_else(|| {
            CapsError::Config(format!(
                "primary capsule kernel {} does not fit a feature map of length {}",
                caps.kernel_size, length
            ))
        })?;
        Ok(out_len * caps.n_channels)
    }

    pub fn validate(&self) -> Result<()> {
        let (length, channels) = self.input_shape;
        if length == 0 || channels == 0 {
            return Err(CapsError::Config("input shape must be non-empty".into()));
        }
        if self.n_class == 0 {
            return Err(CapsError::Config("n_class must be at least 1".into()));
        }
        for layer in &self.feature_layers {
            match layer {
                LayerConfig::Conv1d {
                    filters,
                    kernel_size,
                    stride,
                    ..
                } => {
                    if *filters == 0 || *kernel_size == 0 || *stride == 0 {
                        return Err(CapsError::Config(
                            "conv1d filters, kernel_size and stride must be positive".into(),
                        ));
                    }
                }
                LayerConfig::Dropout { rate } => check_rate(*rate)?,
            }
        }

        let caps = &self.primary_caps;
        if caps.dim_capsule == 0 || caps.n_channels == 0 || caps.kernel_size == 0 || caps.stride == 0
        {
            return Err(CapsError::Config(
                "primary capsule dimensions must be positive".into(),
            ));
        }
        check_rate(caps.dropout)?;

        let digit = &self.digit_caps;
        if digit.dim_capsule == 0 {
            return Err(CapsError::Config("digit capsule dim must be positive".into()));
        }
        if digit.routings == 0 {
            return Err(CapsError::Config("routings must be at least 1".into()));
        }
        check_rate(digit.dropout)?;

        if self.decoder.hidden_units.iter().any(|&u| u == 0) {
            return Err(CapsError::Config("decoder units must be positive".into()));
        }
        if !matches!(
            self.class_activation,
            Activation::Linear | Activation::Softmax
        ) {
            return Err(CapsError::Config(
                "class activation must be linear or softmax".into(),
            ));
        }

        self.primary_capsule_count().map(|_| ())
    }
}

fn check_rate(rate: f32) -> Result<()> {
    if (0.0..1.0).contains(&rate) {
        Ok(())
    } else {
        Err(CapsError::Config(format!(
            "dropout rate {} outside [0, 1)",
            rate
        )))
    }
}

/// Longueur de sortie d'une convolution "valid", `None` si le noyau ne tient pas.
pub fn conv_output_length(length: usize, kernel_size: usize, stride: usize) -> Option<usize> {
    if kernel_size == 0 || stride == 0 || length < kernel_size {
        return None;
    }
    Some((length - kernel_size) / stride + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
        }
    }
}

/// Loss appliquée à la sortie de classe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CapsuleLossKind {
    Margin,
    Spread { margin: f32 },
    BinaryCrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        /// Décroissance en temps inverse, par itération.
        decay: f32,
    },
    Sgd {
        momentum: f32,
    },
}

impl Default for OptimizerType {
    fn default() -> Self {
        OptimizerType::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub nb_classes: usize,
    pub nb_epoch: usize,
    /// Patience de l'early stopping sur `val_capsnet_loss`.
    pub earlystop: Option<usize>,
    /// Poids chargés dans un modèle neuf avant l'entraînement.
    pub weights: Option<PathBuf>,
    pub lr: f32,
    /// Décroissance multiplicative du learning rate par époque.
    pub lrdecay: f32,
    pub batch_size: usize,
    pub lam_recon: f32,
    pub routings: usize,
    pub model_type: ModelType,
    pub class_weight: Option<Vec<f32>>,
    pub predict: bool,
    /// Fraction réservée à la validation quand l'early stopping n'a pas de jeu de validation.
    pub validation_split: f32,
    pub seed: u64,
    pub optimizer: OptimizerType,
    /// Remplace la loss déduite de `model_type`.
    pub capsule_loss: Option<CapsuleLossKind>,
    pub loss_config: LossConfig,
}

/// Plafond d'époques quand l'early stopping décide de la fin.
pub const EARLY_STOP_EPOCH_LIMIT: usize = 10_000;

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            nb_classes: 2,
            nb_epoch: 500,
            earlystop: None,
            weights: None,
            lr: 0.001,
            lrdecay: 1.0,
            batch_size: 500,
            lam_recon: 0.392,
            routings: 3,
            model_type: ModelType::NoGradientStop,
            class_weight: None,
            predict: false,
            validation_split: 0.1,
            seed: 7,
            optimizer: OptimizerType::default(),
            capsule_loss: None,
            loss_config: LossConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn capsule_loss_kind(&self) -> CapsuleLossKind {
        self.capsule_loss.unwrap_or(if self.model_type.uses_cross_entropy() {
            CapsuleLossKind::BinaryCrossEntropy
        } else {
            CapsuleLossKind::Margin
        })
    }

    /// Limite d'époques, une fois connu l'état réel de l'early stopping.
    ///
    /// `nb_epoch` s'applique dès qu'aucun arrêt n'est actif, y compris quand
    /// `earlystop` est défini sans ligne de validation disponible.
    pub fn epoch_limit(&self, early_stopping_active: bool) -> usize {
        if early_stopping_active {
            EARLY_STOP_EPOCH_LIMIT
        } else {
            self.nb_epoch
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nb_classes == 0 {
            return Err(CapsError::Config("nb_classes must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(CapsError::Config("batch_size must be positive".into()));
        }
        if !(self.lr > 0.0) {
            return Err(CapsError::Config("lr must be positive".into()));
        }
        if !(self.lrdecay > 0.0) {
            return Err(CapsError::Config("lrdecay must be positive".into()));
        }
        if self.lam_recon < 0.0 {
            return Err(CapsError::Config("lam_recon must be non-negative".into()));
        }
        if self.routings == 0 {
            return Err(CapsError::Config("routings must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(CapsError::Config(
                "validation_split must be in [0, 1)".into(),
            ));
        }
        if self.earlystop == Some(0) {
            return Err(CapsError::Config("earlystop patience must be positive".into()));
        }
        if let Some(weights) = &self.class_weight {
            if weights.len() != self.nb_classes {
                return Err(CapsError::Config(format!(
                    "class_weight has {} entries for {} classes",
                    weights.len(),
                    self.nb_classes
                )));
            }
            if weights.iter().any(|w| *w < 0.0) {
                return Err(CapsError::Config("class weights must be non-negative".into()));
            }
        }
        if let CapsuleLossKind::Spread { margin } = self.capsule_loss_kind() {
            if margin < 0.0 {
                return Err(CapsError::Config("spread margin must be non-negative".into()));
            }
        }
        Ok(())
    }
}
