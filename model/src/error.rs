use thiserror::Error;

/// Erreurs de construction, d'entraînement et de sauvegarde du réseau.
#[derive(Debug, Error)]
pub enum CapsError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    Shape {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    #[error("invalid dataset: {0}")]
    Data(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("backward called before forward on {0}")]
    MissingForward(&'static str),

    #[error("array layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CapsError {
    pub fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        CapsError::Shape {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsError>;
