use std::convert::Infallible;

use axum::{response::IntoResponse, Json};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a request failure. The kind decides the status code;
/// the message is human-readable only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing fields, out-of-range numbers, wrong array shape.
    Validation,
    /// No signature/timestamp or no cron secret where one is required.
    AuthMissing,
    /// Bad signature, stale timestamp, wrong cron secret, guardian not
    /// authorized. All signature sub-checks collapse into this kind so the
    /// response does not leak which one failed.
    AuthInvalid,
    /// No config, no session (or expired), no switch (or not yours).
    NotFound,
    /// Guardian already approved this session.
    Conflict,
    /// Shares requested before the threshold was reached.
    NotReady,
}

impl ErrorKind {
    fn status_code(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::AuthMissing => StatusCode::UNAUTHORIZED,
            Self::AuthInvalid | Self::NotReady => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("There was a problem with the connection to the sqlite database: {source}")]
    SqliteError {
        #[from]
        source: rusqlite::Error,
    },
    #[error("Could not connect to server: {source}")]
    ReqwestError {
        #[from]
        source: reqwest::Error,
    },
    #[error("Could not do this io: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("Could not (de)serialize: {source}")]
    SerdeJsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("{0}")]
    BadServerResponse(&'static str),
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{0}")]
    /// Don't create this directly. Use Error::bad_database instead.
    BadDatabase(&'static str),
    #[error("{1}")]
    BadRequest(ErrorKind, &'static str),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("BadDatabase: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    /// Sanitizes public-facing errors that can leak sensitive information.
    fn sanitized_message(&self) -> String {
        match self {
            Self::SqliteError { .. }
            | Self::IoError { .. }
            | Self::SerdeJsonError { .. }
            | Self::BadConfig(_)
            | Self::BadDatabase(_) => String::from("Database or I/O error occurred."),
            _ => self.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(kind, _) => kind.status_code(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Infallible> for Error {
    fn from(i: Infallible) -> Self {
        match i {}
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code();
        let message = self.sanitized_message();

        info!("Returning an error: {}: {}", status_code, message);

        (status_code, Json(json!({ "error": message }))).into_response()
    }
}
