//! Axum `IntoResponse` wiring for the HTTP-facing error taxonomy defined in
//! `gateway-core::error`. This crate owns the only conversion from a
//! `DispatchError` to an actual HTTP response; everything upstream of this
//! module deals in typed errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway_core::DispatchError;

pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self.0.to_body())).into_response()
    }
}
