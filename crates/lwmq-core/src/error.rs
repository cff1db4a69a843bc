// ── Core error types ──
//
// Every local API call and every dispatch flow settles with one of these.
// Collaborator errors (store, transport, diff engine) are folded in via
// `From` so flows can use `?` freely; `status_code()` decides what the
// transport peer sees.

use thiserror::Error;

use crate::diff::DiffError;
use crate::model::{DeviceId, StatusCode};
use crate::store::StoreError;
use crate::transport::TransportError;
use crate::wire::Command;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Validation errors ────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Unknown property: {path}")]
    UnknownProperty { path: String },

    #[error("Invalid resource path: {path}")]
    InvalidPath { path: String },

    #[error("Malformed payload: {message}")]
    Malformed { message: String },

    // ── Lookup / identity errors ─────────────────────────────────────
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Hardware id mismatch for {device_id}: registered {expected}, got {got}")]
    Conflict {
        device_id: DeviceId,
        expected: String,
        got: String,
    },

    // ── Reachability errors ──────────────────────────────────────────
    #[error("Device {device_id} is not ready")]
    NotReady { device_id: DeviceId },

    #[error("Device {device_id} is unreachable")]
    Unreachable { device_id: DeviceId },

    #[error("{command} request to {device_id} timed out after {timeout_ms}ms")]
    Timeout {
        device_id: DeviceId,
        command: Command,
        timeout_ms: u64,
    },

    #[error("{command} request to {device_id} was cancelled")]
    Cancelled { device_id: DeviceId, command: Command },

    #[error("No free transaction id for {command} on {device_id}")]
    TooManyPending { device_id: DeviceId, command: Command },

    #[error("Device {device_id} answered {command} with {status}")]
    Rejected {
        device_id: DeviceId,
        command: Command,
        status: StatusCode,
    },

    // ── Collaborator errors ──────────────────────────────────────────
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Status code reported to a transport peer when a flow fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. }
            | Self::UnknownProperty { .. }
            | Self::InvalidPath { .. }
            | Self::Malformed { .. } => StatusCode::BadRequest,
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::Conflict { .. } => StatusCode::Conflict,
            _ => StatusCode::InternalServerError,
        }
    }

    /// `true` for the "no answer by the deadline" failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn malformed(message: impl std::fmt::Display) -> Self {
        Self::Malformed {
            message: message.to_string(),
        }
    }
}

// ── Conversion from the diff engine ──────────────────────────────────

impl From<DiffError> for CoreError {
    fn from(err: DiffError) -> Self {
        match err {
            DiffError::UnknownProperty { path } => Self::UnknownProperty { path },
        }
    }
}
