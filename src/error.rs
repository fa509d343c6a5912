use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum Error {
    /// Used when the user pass a logical invalid parameter to a function.
    #[error("Parameter error: {0}")]
    InvalidParameter(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parser error: {0}")]
    Parser(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    /// A persisted file does not follow the expected layout.
    #[error("Format error: {0}")]
    Format(String),
}

impl Error {
    /// Create a error with the kind `InvalidParameter`.
    /// # Arguments
    /// * `msg` - The error message.
    pub fn invalid_parameter<T: ToString>(msg: T) -> Self {
        Error::InvalidParameter(msg.to_string())
    }

    pub fn format<T: ToString>(msg: T) -> Self {
        Error::Format(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parser(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
