pub mod dms;
pub mod recovery;

use axum::{
    extract::{FromRequest, Request},
    response::IntoResponse,
};
use serde::de::DeserializeOwned;

use crate::{Error, ErrorKind, Result};

/// axum's Json, with the rejection folded into the uniform
/// `{"error": "<message>"}` error shape.
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|_| Error::BadRequest(ErrorKind::Validation, "Invalid JSON body"))?;

        Ok(Self(value))
    }
}

impl<T: serde::Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> axum::response::Response {
        axum::Json(self.0).into_response()
    }
}

/// Pulls the signature and timestamp out of a signed request body, turning
/// their absence into the 401 the error taxonomy asks for.
pub(crate) fn auth_fields<'a>(
    signature: &'a Option<String>,
    timestamp: Option<u64>,
) -> Result<(&'a str, u64)> {
    match (signature, timestamp) {
        (Some(signature), Some(timestamp)) => Ok((signature.as_str(), timestamp)),
        _ => Err(Error::BadRequest(
            ErrorKind::AuthMissing,
            "Missing signature or timestamp",
        )),
    }
}
