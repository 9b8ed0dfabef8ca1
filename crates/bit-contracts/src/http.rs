//! # Request and Response Values
//!
//! What the router hands to [`Bit::handle`](crate::Bit::handle) and what it
//! expects back. Bits never see axum extractors.

use crate::errors::BitError;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

/// An HTTP request addressed to a bit.
#[derive(Debug, Clone)]
pub struct BitRequest {
    pub method: Method,
    /// Path below the bit's route, always starting with `/` (`/` for the
    /// route itself).
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl BitRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// A `GET` for the route itself.
    pub fn get() -> Self {
        Self::new(Method::GET, "/")
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BitError> {
        if self.body.is_empty() {
            return Err(BitError::BadRequest("empty request body".to_string()));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A bit's reply.
#[derive(Debug, Clone)]
pub struct BitResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl BitResponse {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BitError> {
        let body = serde_json::to_vec(value).map_err(BitError::internal)?;
        Ok(Self {
            status: StatusCode::OK,
            content_type: "application/json",
            body: body.into(),
        })
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/plain; charset=utf-8",
            body: Bytes::from(body.into()),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/html; charset=utf-8",
            body: Bytes::from(body.into()),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl IntoResponse for BitResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type))],
            self.body,
        )
            .into_response()
    }
}

impl IntoResponse for BitError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Order {
        sku: String,
    }

    #[test]
    fn test_request_json_body() {
        let req = BitRequest::new(Method::POST, "/").with_body(r#"{"sku":"A-1"}"#);
        let order: Order = req.json().unwrap();
        assert_eq!(order.sku, "A-1");

        let empty = BitRequest::get();
        assert!(matches!(
            empty.json::<Order>(),
            Err(BitError::BadRequest(_))
        ));
    }

    #[test]
    fn test_response_status_and_type() {
        let resp = BitResponse::json(&serde_json::json!({ "ok": true })).unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.content_type, "application/json");

        let http = BitError::NotFound("gone".into()).into_response();
        assert_eq!(http.status(), StatusCode::NOT_FOUND);
    }
}
