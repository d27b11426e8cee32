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

//! Connection and polling configuration for one Proteus inverter

use crate::errors::{ProteusError, ProteusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://proteus.deltagreen.cz/api/trpc/";
pub const DEFAULT_ORIGIN: &str = "https://proteus.deltagreen.cz";
pub const DEFAULT_TENANT_ID: &str = "TID_DELTA_GREEN";

const INVERTER_ID_LEN: usize = 25;

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_owned()
}

fn default_tenant_id() -> String {
    DEFAULT_TENANT_ID.to_owned()
}

fn default_25() -> u64 {
    25
}

fn default_30() -> u64 {
    30
}

fn default_10() -> u32 {
    10
}

fn default_100() -> u64 {
    100
}

fn default_2000() -> u64 {
    2000
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProteusConfig {
    /// Inverter ID from the Proteus web app URL
    pub inverter_id: String,

    /// Login e-mail (password login must be enabled on the account)
    pub email: String,

    pub password: String,

    /// tRPC base URL, must end with a slash
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Value of the Origin header sent with every request
    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_25")]
    pub request_timeout_secs: u64,

    /// Background polling period (seconds), also caps retry backoff
    #[serde(default = "default_30")]
    pub poll_interval_secs: u64,

    /// Maximum attempts for a request failing at connection level
    #[serde(default = "default_10")]
    pub retry_max_attempts: u32,

    /// First retry delay (milliseconds), doubled on every attempt
    #[serde(default = "default_100")]
    pub retry_base_delay_ms: u64,

    /// Delay between an accepted control command and the follow-up refresh (milliseconds)
    #[serde(default = "default_2000")]
    pub refresh_debounce_ms: u64,
}

impl ProteusConfig {
    pub fn new(
        inverter_id: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            inverter_id: inverter_id.into(),
            email: email.into(),
            password: password.into(),
            base_url: default_base_url(),
            origin: default_origin(),
            tenant_id: default_tenant_id(),
            request_timeout_secs: default_25(),
            poll_interval_secs: default_30(),
            retry_max_attempts: default_10(),
            retry_base_delay_ms: default_100(),
            refresh_debounce_ms: default_2000(),
        }
    }

    /// Point the client at a different backend (tests, staging)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    /// Check the configuration before any network call is attempted
    pub fn validate(&self) -> ProteusResult<()> {
        validate_inverter_id(&self.inverter_id)?;

        if self.email.trim().is_empty() {
            return Err(ProteusError::Config("email must not be empty".to_owned()));
        }
        if self.password.is_empty() {
            return Err(ProteusError::Config("password must not be empty".to_owned()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ProteusError::Config(
                "poll_interval_secs must be at least 1".to_owned(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ProteusError::Config(
                "request_timeout_secs must be at least 1".to_owned(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ProteusError::Config(
                "retry_max_attempts must be at least 1".to_owned(),
            ));
        }
        reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProteusError::Config(format!("invalid base_url: {e}")))?;

        Ok(())
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for ProteusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProteusConfig")
            .field("inverter_id", &self.inverter_id)
            .field("email", &self.email)
            .field("password", &"***")
            .field("base_url", &self.base_url)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish_non_exhaustive()
    }
}

/// Inverter IDs are exactly 25 lowercase ASCII letters or digits.
pub fn validate_inverter_id(inverter_id: &str) -> ProteusResult<()> {
    let valid = inverter_id.len() == INVERTER_ID_LEN
        && inverter_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ProteusError::InvalidInverterId(inverter_id.to_owned()))
    }
}
