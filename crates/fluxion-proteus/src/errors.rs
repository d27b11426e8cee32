// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Error types for the Proteus client

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProteusError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session is open but the CSRF cookie is missing")]
    MissingCsrf,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("control call {endpoint} failed: {reason}")]
    ControlFailed { endpoint: String, reason: String },

    #[error("invalid inverter id '{0}': expected 25 lowercase letters or digits")]
    InvalidInverterId(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ProteusError {
    /// Errors meaning the held session is not really authenticated.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Auth(_) | Self::MissingCsrf => true,
            Self::Transport(TransportError::HttpStatus { status, .. }) => {
                *status == 401 || *status == 403
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused/reset/timed out. Retried before surfacing.
    #[error("connection to {url} failed after {attempts} attempts: {source}")]
    Connection {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-200 status. Never retried.
    #[error("{method} {url} returned status {status}")]
    HttpStatus {
        method: String,
        url: String,
        status: u16,
        body: Option<Value>,
    },

    /// The request could not be built or sent for a non-connection reason
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not decode batch response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {expected} batch entries, got {actual}")]
    Missing { expected: usize, actual: usize },

    #[error("batch entry {index}: missing or invalid '{field}'")]
    Malformed { index: usize, field: String },
}

/// Errors surfaced by the polling coordinator to its direct callers.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("refresh failed: {0}")]
    RefreshFailed(#[source] Arc<ProteusError>),

    #[error("control command failed: {0}")]
    ControlFailed(#[source] Arc<ProteusError>),

    #[error("coordinator is closed")]
    Closed,

    #[error("polling interval must be greater than zero")]
    InvalidInterval,

    #[error("refresh task stopped before finishing: {0}")]
    RefreshAborted(String),
}

pub type ProteusResult<T> = std::result::Result<T, ProteusError>;
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
