use std::io;

use thiserror::Error;

use crate::core::identifiers::IdParseError;
use crate::core::sending::SendError;
use crate::core::serde::CanonicalJsonError;
use crate::core::signatures;
use crate::core::state::StateError;
use crate::core::MatrixError;

pub type AppResult<T> = Result<T, AppError>;

/// Every failure mode of the engine, collapsed into one type at module
/// boundaries.
///
/// `Matrix` carries the error taxonomy that crosses the federation
/// boundary; everything else is internal and maps to `M_UNKNOWN` when it
/// must be reported to a peer.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("public: `{0}`")]
    Public(String),
    #[error("internal: `{0}`")]
    Internal(String),
    #[error("io: `{0}`")]
    Io(#[from] io::Error),
    #[error("serde json: `{0}`")]
    SerdeJson(#[from] serde_json::error::Error),
    #[error("reqwest: `{0}`")]
    Reqwest(#[from] reqwest::Error),
    #[error("reqwest middleware: `{0}`")]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),
    #[error("url parse: `{0}`")]
    UrlParse(#[from] url::ParseError),
    #[error("Matrix error: `{0}`")]
    Matrix(#[from] MatrixError),
    #[error("Send error: `{0}`")]
    Send(#[from] SendError),
    #[error("ID parse error: `{0}`")]
    IdParse(#[from] IdParseError),
    #[error("CanonicalJson error: `{0}`")]
    CanonicalJson(#[from] CanonicalJsonError),
    #[error("signatures error: `{0}`")]
    Signatures(#[from] signatures::Error),
    #[error("state error: `{0}`")]
    State(#[from] StateError),
    #[error("config error: `{0}`")]
    Figment(#[from] figment::Error),
}

impl AppError {
    pub fn public<S: Into<String>>(msg: S) -> Self {
        Self::Public(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The Matrix-level error this maps to at the federation boundary.
    pub fn to_matrix(&self) -> MatrixError {
        match self {
            Self::Matrix(e) => e.clone(),
            Self::Public(msg) => MatrixError::unknown(msg.as_str()),
            Self::State(e) => MatrixError::forbidden(e.to_string()),
            Self::CanonicalJson(e) => MatrixError::bad_json(e.to_string()),
            _ => MatrixError::unknown("internal server error"),
        }
    }

    /// Whether the error maps to `M_NOT_FOUND`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Matrix(MatrixError {
                kind: crate::core::ErrorKind::NotFound,
                ..
            })
        )
    }
}
