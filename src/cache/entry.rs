//! Stored form of a cached response.
//!
//! A response is kept as two records: a JSON header record under `key:headers`
//! and the raw payload under `key:body`. The body record is only written for
//! non-empty payloads; the header record's `body` flag says whether to expect it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{Headers, Response, StatusCode, UnknownStatus};

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("malformed header record: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),

    #[error("header record expects a body but none was stored")]
    MissingBody,
}

/// The `key:headers` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub message: String,
    pub header: Headers,
    pub body: bool,
}

impl ResponseRecord {
    /// Split `response` into its header record and, when non-empty, its body.
    pub fn capture(response: &Response) -> (Self, Option<Bytes>) {
        let payload = response.payload();
        let body = (!payload.is_empty()).then(|| payload.clone());
        let record = Self {
            status: response.status().as_u16(),
            message: response.message().to_owned(),
            header: response.headers().clone(),
            body: body.is_some(),
        };
        (record, body)
    }

    pub fn encode(&self) -> Result<Bytes, EntryError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EntryError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Rebuild the response this record was captured from.
    ///
    /// # Errors
    ///
    /// [`EntryError::MissingBody`] when the record flags a body and `body` is
    /// `None` (the body record expired or was evicted first), and
    /// [`EntryError::UnknownStatus`] for a status this crate cannot represent.
    pub fn replay(self, body: Option<Bytes>) -> Result<Response, EntryError> {
        let status = StatusCode::try_from(self.status)?;
        let mut response = Response::new(status).reason(self.message);
        for (name, value) in self.header.iter() {
            response.add_header(name, value);
        }

        match (self.body, body) {
            (true, Some(body)) => Ok(response.body_bytes(body)),
            (true, None) => Err(EntryError::MissingBody),
            (false, _) => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin_response() -> Response {
        Response::new(StatusCode::Created)
            .reason("Made")
            .header("Content-Type", "application/json")
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2")
            .body(r#"{"id":7}"#)
    }

    #[test]
    fn capture_keeps_recognized_fields() {
        let (record, body) = ResponseRecord::capture(&origin_response());
        assert_eq!(record.status, 201);
        assert_eq!(record.message, "Made");
        assert_eq!(record.header.len(), 3);
        assert!(record.body);
        assert_eq!(body.as_deref(), Some(&br#"{"id":7}"#[..]));
    }

    #[test]
    fn empty_body_is_not_captured() {
        let (record, body) = ResponseRecord::capture(&Response::new(StatusCode::NoContent));
        assert!(!record.body);
        assert!(body.is_none());
        assert_eq!(record.message, "No Content");
    }

    #[test]
    fn stored_response_replays_identically() {
        let original = origin_response();
        let (record, body) = ResponseRecord::capture(&original);
        let raw = record.encode().unwrap();

        let replayed = ResponseRecord::decode(&raw).unwrap().replay(body).unwrap();

        assert_eq!(replayed.status(), original.status());
        assert_eq!(replayed.message(), original.message());
        assert_eq!(replayed.headers(), original.headers());
        assert_eq!(replayed.payload(), original.payload());
    }

    #[test]
    fn wire_format() {
        let response = Response::new(StatusCode::Ok).header("X-A", "1").body("hi");
        let (record, _) = ResponseRecord::capture(&response);
        let json: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": 200,
                "message": "OK",
                "header": {"X-A": "1"},
                "body": true,
            })
        );
    }

    #[test]
    fn missing_body_record_is_an_error() {
        let (record, _) = ResponseRecord::capture(&origin_response());
        assert!(matches!(record.replay(None), Err(EntryError::MissingBody)));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            ResponseRecord::decode(b"not json"),
            Err(EntryError::Json(_))
        ));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let record = ResponseRecord {
            status: 299,
            message: "Odd".into(),
            header: Headers::new(),
            body: false,
        };
        assert!(matches!(
            record.replay(None),
            Err(EntryError::UnknownStatus(UnknownStatus(299)))
        ));
    }
}
