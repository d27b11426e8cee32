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

pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod traits;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_fixtures;

pub use client::ProteusClient;
pub use config::ProteusConfig;
pub use coordinator::{Coordinator, CoordinatorHandle, RefreshStatus};
pub use errors::{
    CoordinatorError, CoordinatorResult, ParseError, ProteusError, ProteusResult, TransportError,
};
pub use parser::parse_snapshot;
pub use scheduler::CommandExpiryScheduler;
pub use session::{Session, SessionManager};
pub use traits::SnapshotSource;
pub use transport::{BatchEntry, BatchRequest, BatchResponse, BatchTransport, Method, RetryPolicy};
pub use types::{
    ActiveCommand, ControlMode, ControlType, FlexibilityRewards, ForecastMetadata, Snapshot,
};
