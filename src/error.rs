use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image dimensions (w: {width}, h: {height})")]
    InvalidImage { width: u32, height: u32 },
    #[error("invalid scale: {0}")]
    InvalidScale(String),
    /// Weights are missing or failed to load. Callers are expected to degrade
    /// rather than abort when they see this.
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, Error::ModelUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
