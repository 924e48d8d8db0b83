//! Message envelope exchanged on every connection.
//!
//! A request carries `method` and `content`. A response echoes `method` and
//! carries either `content` or a non-empty `err`. When `err` is set the
//! content is treated as absent.

use crate::error::{Error, Result};

/// Codec-encoded payload bytes that have not been decoded into a typed value.
///
/// The server keeps request payloads in this form until the target method,
/// and with it the request type, is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// One request or response on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Dotted `Service.Method` name. Echoed on responses.
    pub method: String,
    /// Payload, still in the codec's encoding.
    pub content: Option<RawPayload>,
    /// Error text. Empty means success.
    pub err: String,
}

impl Message {
    /// Create a request for `method`.
    pub fn request(method: impl Into<String>, content: RawPayload) -> Self {
        Self {
            method: method.into(),
            content: Some(content),
            err: String::new(),
        }
    }

    /// Create a success response carrying `content`.
    pub fn success(method: impl Into<String>, content: RawPayload) -> Self {
        Self {
            method: method.into(),
            content: Some(content),
            err: String::new(),
        }
    }

    /// Create an error response. The content is always absent.
    pub fn failure(method: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            content: None,
            err: err.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.err.is_empty()
    }

    /// Content of a successful message, `None` when `err` is set.
    pub fn payload(&self) -> Option<&RawPayload> {
        if self.is_error() {
            None
        } else {
            self.content.as_ref()
        }
    }

    /// Convert a response into its payload, or [`Error::Remote`] when the
    /// peer reported an error.
    pub fn into_result(self) -> Result<Option<RawPayload>> {
        if self.is_error() {
            return Err(Error::Remote(self.err));
        }
        Ok(self.content)
    }
}
