// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Conversion
//!
//! Turns application payloads into wire bytes and back. The converter is chosen
//! per runtime and is free to use the message content type to pick a format.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for UTF-8 text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for opaque binary messages
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Serializes any `serde` value into a JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Payload, AmqpError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// Interprets the payload as `T`. JSON payloads are converted directly,
    /// text and bytes are parsed as JSON documents.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        let decoded = match self {
            Payload::Json(value) => serde_json::from_value(value.clone()),
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        };

        decoded.map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Wire form of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Pluggable payload codec.
pub trait MessageConverter: Send + Sync {
    fn to_message(&self, payload: &Payload) -> Result<Encoded, AmqpError>;

    fn from_message(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Payload, AmqpError>;
}

/// JSON for `application/json`, UTF-8 text for `text/*`, raw bytes otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleMessageConverter;

impl MessageConverter for SimpleMessageConverter {
    fn to_message(&self, payload: &Payload) -> Result<Encoded, AmqpError> {
        let encoded = match payload {
            Payload::Json(value) => Encoded {
                bytes: serde_json::to_vec(value)
                    .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?,
                content_type: JSON_CONTENT_TYPE.to_owned(),
            },
            Payload::Text(text) => Encoded {
                bytes: text.as_bytes().to_vec(),
                content_type: TEXT_CONTENT_TYPE.to_owned(),
            },
            Payload::Bytes(bytes) => Encoded {
                bytes: bytes.clone(),
                content_type: BINARY_CONTENT_TYPE.to_owned(),
            },
        };

        Ok(encoded)
    }

    fn from_message(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Payload, AmqpError> {
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();

        if content_type.starts_with(JSON_CONTENT_TYPE) {
            return serde_json::from_slice(bytes)
                .map(Payload::Json)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string()));
        }

        if content_type.starts_with("text/") {
            return String::from_utf8(bytes.to_vec())
                .map(Payload::Text)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string()));
        }

        Ok(Payload::Bytes(bytes.to_vec()))
    }
}
