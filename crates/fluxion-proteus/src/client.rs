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

//! Proteus API client: the combined read query and the control mutations

use crate::config::ProteusConfig;
use crate::errors::{ProteusError, ProteusResult, TransportError};
use crate::parser::parse_snapshot;
use crate::session::SessionManager;
use crate::traits::SnapshotSource;
use crate::transport::{BatchEntry, BatchRequest, BatchTransport, Method, RetryPolicy};
use crate::types::{ControlMode, ControlType, Snapshot};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Procedures of the combined read query, in batch index order
pub const READ_ENDPOINTS: [&str; 5] = [
    "inverters.detail",
    "inverters.flexibilityRewardsSummary",
    "inverters.controls.state",
    "commands.current",
    "inverters.currentStep",
];
pub const MANUAL_CONTROL_ENDPOINT: &str = "inverters.controls.updateManualControl";
pub const CONTROL_ENABLED_ENDPOINT: &str = "inverters.controls.updateControlEnabled";
pub const CONTROL_MODE_ENDPOINT: &str = "inverters.controls.updateControlMode";
pub const FLEXIBILITY_ENDPOINT: &str = "inverters.controls.updateFlexibilityMode";

#[derive(Debug)]
pub struct ProteusClient {
    inverter_id: String,
    transport: BatchTransport,
}

impl ProteusClient {
    /// Validates the configuration; no network traffic happens until the first call
    pub fn new(config: &ProteusConfig) -> ProteusResult<Self> {
        config.validate()?;

        let session = Arc::new(SessionManager::new(config)?);
        let retry = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay(),
            max_delay: config.poll_interval(),
        };

        info!(
            "Initializing Proteus client for inverter {} at {}",
            config.inverter_id, config.base_url
        );

        Ok(Self {
            inverter_id: config.inverter_id.clone(),
            transport: BatchTransport::new(session, retry),
        })
    }

    pub fn inverter_id(&self) -> &str {
        &self.inverter_id
    }

    pub async fn get_snapshot(&self) -> ProteusResult<Snapshot> {
        let batch = READ_ENDPOINTS
            .iter()
            .fold(BatchRequest::new(), |batch, endpoint| {
                batch.with_call(*endpoint, json!({"inverterId": self.inverter_id}))
            });

        let raw = self.transport.call(&batch, Method::Get).await?;
        let snapshot = parse_snapshot(&raw)?;

        debug!(
            "✅ [PROTEUS RPC] Snapshot: mode={} command={} flexibility={}",
            snapshot.control_mode, snapshot.active_command, snapshot.flexibility_state
        );
        Ok(snapshot)
    }

    pub async fn update_manual_control(
        &self,
        control_type: ControlType,
        enabled: bool,
    ) -> ProteusResult<()> {
        let state = if enabled { "ENABLED" } else { "DISABLED" };
        self.mutate(
            MANUAL_CONTROL_ENDPOINT,
            json!({
                "type": control_type.as_str(),
                "inverterId": self.inverter_id,
                "state": state,
            }),
        )
        .await
    }

    pub async fn update_control_enabled(&self, enabled: bool) -> ProteusResult<()> {
        self.mutate(
            CONTROL_ENABLED_ENDPOINT,
            json!({
                "inverterId": self.inverter_id,
                "controlEnabled": enabled,
            }),
        )
        .await
    }

    pub async fn update_control_mode(&self, mode: ControlMode) -> ProteusResult<()> {
        self.mutate(
            CONTROL_MODE_ENDPOINT,
            json!({
                "inverterId": self.inverter_id,
                "controlMode": mode.as_str(),
            }),
        )
        .await
    }

    pub async fn update_flexibility_capabilities(&self, capabilities: &[String]) -> ProteusResult<()> {
        self.mutate(
            FLEXIBILITY_ENDPOINT,
            json!({
                "inverterId": self.inverter_id,
                "flexibilityCapabilitiesEnabled": capabilities,
            }),
        )
        .await
    }

    pub async fn close(&self) {
        self.transport.session().close().await;
    }

    /// Send a single-call mutation; anything but a successful entry 0 is a failed control
    async fn mutate(&self, endpoint: &str, params: Value) -> ProteusResult<()> {
        info!("📞 [PROTEUS CMD] Calling: {}", endpoint);
        debug!("   Data: {}", params);

        let failed = |reason: String| {
            error!("❌ [PROTEUS CMD] Failed: {} ({})", endpoint, reason);
            ProteusError::ControlFailed {
                endpoint: endpoint.to_owned(),
                reason,
            }
        };

        let batch = BatchRequest::single(endpoint, params);
        match self.transport.call(&batch, Method::Post).await {
            Ok(response) => match response.get(0) {
                Some(BatchEntry::Success(_)) => {
                    info!("✅ [PROTEUS CMD] Success: {}", endpoint);
                    Ok(())
                }
                Some(BatchEntry::Error(error)) => Err(failed(error.to_string())),
                None => Err(failed("empty batch response".to_owned())),
            },
            Err(ProteusError::Transport(TransportError::HttpStatus { status, .. })) => {
                Err(failed(format!("status {status}")))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SnapshotSource for ProteusClient {
    async fn fetch_snapshot(&self) -> ProteusResult<Snapshot> {
        self.get_snapshot().await
    }

    async fn set_manual_control(
        &self,
        control_type: ControlType,
        enabled: bool,
    ) -> ProteusResult<()> {
        self.update_manual_control(control_type, enabled).await
    }

    async fn set_control_enabled(&self, enabled: bool) -> ProteusResult<()> {
        self.update_control_enabled(enabled).await
    }

    async fn set_control_mode(&self, mode: ControlMode) -> ProteusResult<()> {
        self.update_control_mode(mode).await
    }

    async fn set_flexibility_capabilities(&self, capabilities: &[String]) -> ProteusResult<()> {
        self.update_flexibility_capabilities(capabilities).await
    }

    async fn close(&self) {
        ProteusClient::close(self).await;
    }

    fn name(&self) -> &str {
        "proteus"
    }
}
