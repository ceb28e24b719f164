/// Result alias that carries the custom [`BeatlightError`] type.
pub type Result<T> = std::result::Result<T, BeatlightError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatlightError {
    /// Free-form failure, mostly poisoned locks and worker start-up problems.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors, including physical link writes.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration files that fail to parse or serialise.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Failure inside the FFT planner or transform.
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    /// Input rejected by an analysis stage.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration values that cannot drive the pipeline.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A write was attempted on a link that is not open.
    #[error("physical link is not open")]
    LinkClosed,
    /// The output queue was drained from outside its dedicated drain thread.
    #[error("output queue drained while a dedicated drainer owns it")]
    QueueMisuse,
    /// Pixel index that does not fit the wire encoding.
    #[error("pixel index {0} is outside the addressable range")]
    PixelOutOfRange(usize),
    /// Colour wider than 24 bits.
    #[error("colour {0:#x} does not fit in 24 bits")]
    ColorOutOfRange(u32),
}

impl BeatlightError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for BeatlightError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatlightError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
