use ahash::AHashMap;
use axum::{
    Form,
    body::Bytes,
    extract::{FromRequest, Request},
    http::header::CONTENT_TYPE,
};
use serde_json::{Map, Value};

use crate::{ingest::parse_number, server::app_error::AppError};

/// Body of a structured ingest request, JSON or url-encoded form.
///
/// Extraction never fails on content: an unreadable body yields no fields, so
/// the credential check still runs first and validation reports the problem.
#[derive(Debug, Default)]
pub struct IngestBody {
    pub fields: Map<String, Value>,
}

impl IngestBody {
    /// The `key` field, if the body carries one as a string.
    pub fn credential(&self) -> Option<&str> {
        self.fields.get("key").and_then(Value::as_str)
    }

    fn from_json(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(Value::Object(fields)) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Form values arrive as text; ones that read as finite numbers become numbers.
    fn from_form(form: AHashMap<String, String>) -> Self {
        let fields = form
            .into_iter()
            .map(|(name, text)| {
                let value = match parse_number(&text).and_then(serde_json::Number::from_f64) {
                    Some(number) if name != "key" => Value::Number(number),
                    _ => Value::String(text),
                };
                (name, value)
            })
            .collect();
        Self { fields }
    }
}

impl<S> FromRequest<S> for IngestBody
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            return Ok(match Form::<AHashMap<String, String>>::from_request(req, state).await {
                Ok(Form(form)) => Self::from_form(form),
                Err(_) => Self::default(),
            });
        }
        Ok(match Bytes::from_request(req, state).await {
            Ok(bytes) => Self::from_json(&bytes),
            Err(_) => Self::default(),
        })
    }
}
