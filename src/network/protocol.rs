//! Store Wire Protocol
//!
//! Defines the request/response messages exchanged between a
//! [`RemoteStore`](super::RemoteStore) and a [`StoreServer`](super::StoreServer).

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::{Event, Revision};

/// Requests sent by a store client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Read a key
    Read { path: String },

    /// Fetch the store-wide revision
    CurrentRevision,

    /// Conditional write
    CompareAndSwap {
        path: String,
        expected: Revision,
        value: Vec<u8>,
    },

    /// Conditional delete
    CompareAndDelete { path: String, expected: Revision },

    /// Block until the key changes at or after `since`
    WaitForChange { path: String, since: Revision },

    /// Liveness check
    Ping,
}

/// Responses sent by the store server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Value and modification revision of a key
    Value { body: Vec<u8>, revision: Revision },

    /// A revision (current store revision, or the revision of a write)
    Revision(Revision),

    /// Delete succeeded
    Deleted,

    /// A change notification
    Event(Event),

    /// Ping reply
    Pong,

    /// Request failed
    Error { code: ErrorCode, message: String },
}

/// Error codes carried over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Key does not exist
    NotFound,
    /// Requested revision is older than the retained history
    TooLate { revision: Revision },
    /// Key changed at or after the expected revision
    OldRevision { expected: Revision, actual: Revision },
    /// Anything else
    Internal,
}

impl Request {
    /// Serialize request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Read { .. } => "Read",
            Request::CurrentRevision => "CurrentRevision",
            Request::CompareAndSwap { .. } => "CompareAndSwap",
            Request::CompareAndDelete { .. } => "CompareAndDelete",
            Request::WaitForChange { .. } => "WaitForChange",
            Request::Ping => "Ping",
        }
    }

    /// Safe to send again if the first attempt may or may not have arrived
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Request::CompareAndSwap { .. } | Request::CompareAndDelete { .. }
        )
    }
}

impl Response {
    /// Serialize response to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize response from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the response type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Value { .. } => "Value",
            Response::Revision(_) => "Revision",
            Response::Deleted => "Deleted",
            Response::Event(_) => "Event",
            Response::Pong => "Pong",
            Response::Error { .. } => "Error",
        }
    }

    /// Build an error response from a store error
    pub fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::TooLate(revision) => ErrorCode::TooLate { revision: *revision },
            Error::OldRevision { expected, actual } => ErrorCode::OldRevision {
                expected: *expected,
                actual: *actual,
            },
            _ => ErrorCode::Internal,
        };
        Response::Error {
            code,
            message: err.to_string(),
        }
    }

    /// Turn an error response back into the store error it stands for
    pub fn into_error(code: ErrorCode, message: String, path: &str) -> Error {
        match code {
            ErrorCode::NotFound => Error::NotFound(path.to_string()),
            ErrorCode::TooLate { revision } => Error::TooLate(revision),
            ErrorCode::OldRevision { expected, actual } => Error::OldRevision { expected, actual },
            ErrorCode::Internal => Error::Store(message),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body a peer may announce
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
