use axum::extract::{FromRequest, FromRequestParts};
use serde::Deserialize;
use ulid::Ulid;

use super::error::ApiError;

/// `Json` whose rejections use the API error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Single ULID path parameter.
#[derive(Deserialize, FromRequestParts)]
#[serde(transparent)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct IdPath(pub Ulid);
