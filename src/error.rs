pub type Result<T> = std::result::Result<T, OverlayError>;

#[derive(thiserror::Error, Debug)]
pub enum OverlayError {
    #[error("source fetch failed: {0}")]
    Fetch(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("composite failed: {0}")]
    Composite(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("unknown part tag: {0}")]
    UnknownTag(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OverlayError {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn composite(msg: impl Into<String>) -> Self {
        Self::Composite(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn pdf(msg: impl Into<String>) -> Self {
        Self::Pdf(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

impl From<lopdf::Error> for OverlayError {
    fn from(value: lopdf::Error) -> Self {
        OverlayError::Pdf(value.to_string())
    }
}
