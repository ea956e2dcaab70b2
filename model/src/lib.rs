//! Réseau de capsules pour la classification de séquences, avec décodeur de reconstruction.

pub mod error;
pub mod model;
pub mod train_data;

pub use error::{CapsError, Result};
pub use model::{capsnet, CapsNet, History, ModelType, NetworkConfig, TrainingConfig};
pub use train_data::training_strategy::{capsnet_main, TrainingRun};
