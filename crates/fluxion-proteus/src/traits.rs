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

use crate::errors::ProteusResult;
use crate::types::{ControlMode, ControlType, Snapshot};
use async_trait::async_trait;

/// Backend that produces snapshots and accepts control commands for one inverter
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch and parse the full inverter state
    async fn fetch_snapshot(&self) -> ProteusResult<Snapshot>;

    async fn set_manual_control(&self, control_type: ControlType, enabled: bool)
    -> ProteusResult<()>;

    async fn set_control_enabled(&self, enabled: bool) -> ProteusResult<()>;

    async fn set_control_mode(&self, mode: ControlMode) -> ProteusResult<()>;

    async fn set_flexibility_capabilities(&self, capabilities: &[String]) -> ProteusResult<()>;

    /// Release network resources. Must be safe to call more than once.
    async fn close(&self);

    /// Source name for logging
    fn name(&self) -> &str;
}
