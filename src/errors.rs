#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logger error: {0}")]
    Logger(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Suite error: {0}")]
    Suite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Proxy(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Proxy(s.to_string())
    }
}
