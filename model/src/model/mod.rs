pub mod builder;
pub mod capsule;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod decoder;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod routing;

pub use builder::{capsnet, ModelBuilder};
pub use checkpoint::Checkpoint;
pub use config::{ModelType, NetworkConfig, TrainingConfig};
pub use core::{CapsNet, EarlyStopping, History};
pub use loss::{custom_binary_crossentropy, LossFunction, MarginLoss, Metrics, SpreadLoss};
pub use optimizer::{Adam, Optimizer, SGD};
