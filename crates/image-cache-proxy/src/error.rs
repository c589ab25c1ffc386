//! Error types for the image cache proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use image_cache::CacheError;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// The requested image URL is unusable
    InvalidUrl(String),
    /// Upstream answered, but not with an image we can serve
    Upstream(String),
    Http(Box<reqwest::Error>),
    Decode(Box<image::ImageError>),
    Cache(CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::InvalidUrl(msg) => write!(f, "Invalid image URL: {}", msg),
            ProxyError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            ProxyError::Http(err) => write!(f, "HTTP error: {}", err),
            ProxyError::Decode(err) => write!(f, "Image decode error: {}", err),
            ProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Http(err) => Some(err.as_ref()),
            ProxyError::Decode(err) => Some(err.as_ref()),
            ProxyError::Cache(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ProxyError::Cache(CacheError::InvalidKeyDerivation(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) | ProxyError::Http(_) | ProxyError::Decode(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "Request failed");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Http(Box::new(err))
    }
}

impl From<image::ImageError> for ProxyError {
    fn from(err: image::ImageError) -> Self {
        ProxyError::Decode(Box::new(err))
    }
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        ProxyError::Cache(err)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for ProxyError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProxyError::Io(Box::new(std::io::Error::other(err)))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_display() {
        let err = ProxyError::InvalidUrl("ftp://x".to_string());
        assert_eq!(format!("{}", err), "Invalid image URL: ftp://x");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::InvalidUrl("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Cache(CacheError::InvalidKeyDerivation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Upstream("404".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Cache(CacheError::WorkerStopped).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_cache_error_has_source() {
        use std::error::Error;
        let err = ProxyError::from(CacheError::WorkerStopped);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("bad PORT".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad PORT");
    }
}
