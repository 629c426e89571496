// Error type shared by the loading, aggregation, encoding and modelling stages.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("model `{model}` failed: {message}")]
    Model { model: String, message: String },

    #[error("unknown value `{value}` for column `{column}`")]
    UnknownCategory { column: String, value: String },

    #[error("record has no feature column `{0}`")]
    MissingColumn(String),

    #[error("no training rows available")]
    EmptyTrainingSet,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("every model failed to predict ({failed} failures)")]
    NoPrediction { failed: usize },
}

impl ForecastError {
    pub fn model(model: &str, err: impl std::fmt::Display) -> Self {
        ForecastError::Model {
            model: model.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
