use thiserror::Error;

/// Broker error taxonomy. `BadRequest`, `Forbidden` and `NotFound` map to
/// caller mistakes; everything else is an internal failure surfaced through
/// `Anyhow`/`Msg`.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("bad request, {0}")]
    BadRequest(String),
    #[error("forbidden, {0}")]
    Forbidden(String),
    #[error("not found, {0}")]
    NotFound(String),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Json(serde_json::Error),
}

pub type Result<T, E = BrokerError> = anyhow::Result<T, E>;

impl BrokerError {
    #[inline]
    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        BrokerError::BadRequest(msg.into())
    }

    #[inline]
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        BrokerError::Forbidden(msg.into())
    }

    #[inline]
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        BrokerError::NotFound(msg.into())
    }
}

impl From<String> for BrokerError {
    #[inline]
    fn from(e: String) -> Self {
        BrokerError::Msg(e)
    }
}

impl From<&str> for BrokerError {
    #[inline]
    fn from(e: &str) -> Self {
        BrokerError::Msg(e.to_string())
    }
}

impl From<anyhow::Error> for BrokerError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Anyhow(e)
    }
}

impl From<serde_json::Error> for BrokerError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Json(e)
    }
}
