use prost::Message;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::domain::{TransactionCreatedEvent, TRANSACTION_CREATED_EVENT};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("failed to decode {content_type} payload: {reason}")]
    Decode {
        content_type: String,
        reason: String,
    },
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// `application/x-protobuf; schema=<event type>`
pub fn protobuf_content_type(schema: &str) -> String {
    format!("{}; schema={}", PROTOBUF_CONTENT_TYPE, schema)
}

fn schema_of(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("schema="))
        .next()
}

fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

pub fn encode_event<M: Message>(event: &M) -> Vec<u8> {
    event.encode_to_vec()
}

/// Decodes a protobuf event. Fields unknown to this build are skipped.
pub fn decode_event<M: Message + Default>(payload: &[u8]) -> Result<M, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    M::decode(payload).map_err(|e| CodecError::Decode {
        content_type: PROTOBUF_CONTENT_TYPE.to_string(),
        reason: e.to_string(),
    })
}

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    serde_json::from_slice(payload).map_err(|e| CodecError::Decode {
        content_type: JSON_CONTENT_TYPE.to_string(),
        reason: e.to_string(),
    })
}

/// Checks that a stored payload is readable under its declared content type
/// before it is handed to the broker.
pub fn verify_payload(payload: &[u8], content_type: &str) -> Result<(), CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }

    match media_type(content_type) {
        JSON_CONTENT_TYPE => decode_json::<serde_json::Value>(payload).map(|_| ()),
        PROTOBUF_CONTENT_TYPE => match schema_of(content_type) {
            Some(TRANSACTION_CREATED_EVENT) => {
                decode_event::<TransactionCreatedEvent>(payload).map(|_| ())
            }
            _ => Ok(()),
        },
        other => Err(CodecError::UnsupportedContentType(other.to_string())),
    }
}
