pub mod data_loader;
pub mod training_strategy;
