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

//! FluxION Proteus bridge
//!
//! Polls one Delta Green Proteus inverter and logs every snapshot change until Ctrl-C.

mod config;

use anyhow::Context;
use fluxion_proteus::{Coordinator, Snapshot};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fluxion_proteus=info".parse()?),
        )
        .init();

    info!("Starting FluxION Proteus bridge");

    let config = config::load_config()?;
    info!(
        "Loaded config: inverter={}, poll_interval={}s, base_url={}",
        config.inverter_id, config.poll_interval_secs, config.base_url
    );

    let coordinator =
        Coordinator::configure(config).context("Failed to configure Proteus coordinator")?;

    match coordinator.refresh_now().await {
        Ok(snapshot) => log_snapshot(&snapshot),
        Err(e) => warn!("Initial refresh failed, polling will retry: {e}"),
    }

    coordinator.start()?;
    let mut changes = coordinator.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutdown signal received");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = changes.borrow_and_update().clone();
                if let Some(snapshot) = current {
                    log_snapshot(&snapshot);
                }
            }
        }
    }

    coordinator.close().await;
    info!("Shutting down");
    Ok(())
}

fn log_snapshot(snapshot: &Snapshot) {
    let enabled: Vec<&str> = snapshot
        .manual_controls
        .iter()
        .filter(|(_, on)| **on)
        .map(|(control, _)| control.as_str())
        .collect();

    info!(
        "📊 Flexibility {} (available: {}), mode {}, control enabled: {}, rewards today {:.2} / month {:.2} / total {:.2}",
        snapshot.flexibility_state,
        snapshot.flexibility_available,
        snapshot.control_mode,
        snapshot.control_enabled,
        snapshot.rewards.today,
        snapshot.rewards.month_to_date,
        snapshot.rewards.total
    );
    info!(
        "   Manual controls on: {:?}, capabilities: {:?}",
        enabled, snapshot.flexibility_capabilities
    );
    match snapshot.active_command_end() {
        Some(end) => info!("   Command {} until {}", snapshot.active_command, end),
        None => info!("   No active command"),
    }
}
