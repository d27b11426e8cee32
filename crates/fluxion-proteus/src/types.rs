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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============= Control Type Enum =============

/// Remote-togglable manual behaviours of a Proteus inverter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    /// Sell to the grid instead of charging the battery
    SellingInsteadOfBatteryCharge,
    /// Sell from the battery to the grid
    SellingFromBattery,
    /// Use grid power and keep the battery charge
    UsingFromGridInsteadOfBattery,
    /// Charge the battery from the grid
    SavingToBattery,
    /// Block export overflow to the grid
    BlockingGridOverflow,
}

impl ControlType {
    /// Backend identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SellingInsteadOfBatteryCharge => "SELLING_INSTEAD_OF_BATTERY_CHARGE",
            Self::SellingFromBattery => "SELLING_FROM_BATTERY",
            Self::UsingFromGridInsteadOfBattery => "USING_FROM_GRID_INSTEAD_OF_BATTERY",
            Self::SavingToBattery => "SAVING_TO_BATTERY",
            Self::BlockingGridOverflow => "BLOCKING_GRID_OVERFLOW",
        }
    }

    pub fn all() -> &'static [ControlType] {
        &[
            Self::SellingInsteadOfBatteryCharge,
            Self::SellingFromBattery,
            Self::UsingFromGridInsteadOfBattery,
            Self::SavingToBattery,
            Self::BlockingGridOverflow,
        ]
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown control type: '{s}'"))
    }
}

// ============= Control Mode Enum =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    /// Backend algorithm decides
    Automatic,
    /// Manual control toggles apply
    Manual,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "AUTOMATIC",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" => Ok(Self::Automatic),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(format!("Unknown control mode: '{s}'")),
        }
    }
}

// ============= Active Command =============

/// Flexibility command currently dispatched to the inverter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActiveCommand {
    #[default]
    None,
    /// Command type as reported by the backend (e.g. "CHARGE")
    Active(String),
}

impl ActiveCommand {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "NONE",
            Self::Active(kind) => kind,
        }
    }
}

impl fmt::Display for ActiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============= Snapshot =============

/// Flexibility trading rewards with VAT, rounded to 2 decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct FlexibilityRewards {
    pub today: f64,
    pub month_to_date: f64,
    pub total: f64,
}

/// Metadata of the current forecast step. Every field may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ForecastMetadata {
    pub flexalgo_battery: Option<String>,
    pub flexalgo_battery_fallback: Option<String>,
    pub flexalgo_pv: Option<String>,
    /// Percent
    pub target_soc: Option<f64>,
    /// Wh
    pub predicted_production: Option<f64>,
    /// Wh
    pub predicted_consumption: Option<f64>,
}

/// Normalized point-in-time state of one inverter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Raw flexibility state reported by the backend
    pub flexibility_state: String,
    pub flexibility_available: bool,
    pub control_mode: ControlMode,
    pub control_enabled: bool,
    pub rewards: FlexibilityRewards,
    /// Always holds every [`ControlType`]
    pub manual_controls: BTreeMap<ControlType, bool>,
    pub flexibility_capabilities: Vec<String>,
    pub active_command: ActiveCommand,
    pub command_end: Option<DateTime<Utc>>,
    pub forecast: ForecastMetadata,
}

impl Snapshot {
    pub fn manual_control(&self, control_type: ControlType) -> bool {
        self.manual_controls
            .get(&control_type)
            .copied()
            .unwrap_or(false)
    }

    /// End of the active command, if one is running
    pub fn active_command_end(&self) -> Option<DateTime<Utc>> {
        if self.active_command.is_active() {
            self.command_end
        } else {
            None
        }
    }

    /// Reset the active command to NONE. Touches no other field.
    pub fn clear_command(&mut self) {
        self.active_command = ActiveCommand::None;
        self.command_end = None;
    }

    /// Clear a command whose end time is not strictly after `now`.
    /// Returns true if the snapshot changed.
    pub fn expire_command(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active_command.is_active() {
            return false;
        }
        match self.command_end {
            Some(end) if end > now => false,
            _ => {
                self.clear_command();
                true
            }
        }
    }
}
