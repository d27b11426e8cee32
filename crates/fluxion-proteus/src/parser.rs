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

//! Normalizes the five-way read batch into a [`Snapshot`]

use crate::errors::ParseError;
use crate::transport::{BatchEntry, BatchResponse};
use crate::types::{
    ActiveCommand, ControlMode, ControlType, FlexibilityRewards, ForecastMetadata, Snapshot,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const EXPECTED_ENTRIES: usize = 5;

const IDX_DETAIL: usize = 0;
const IDX_REWARDS: usize = 1;
const IDX_CONTROLS: usize = 2;
const IDX_COMMAND: usize = 3;
const IDX_STEP: usize = 4;

fn malformed(index: usize, field: &str) -> ParseError {
    ParseError::Malformed {
        index,
        field: field.to_owned(),
    }
}

/// Round to cents, half away from zero, on the value as written in decimal
pub fn round_money(value: f64) -> f64 {
    // `12.345` is stored as 12.34499.. in binary; shifting the decimal string
    // instead of multiplying keeps it at 1234.5 before rounding.
    let scaled = format!("{value}e2")
        .parse::<f64>()
        .unwrap_or(value * 100.0);
    scaled.round() / 100.0
}

/// Parse a batch response into a snapshot. Sections 0-3 are required; the
/// forecast section may be missing, null or failed.
pub fn parse_snapshot(raw: &BatchResponse) -> Result<Snapshot, ParseError> {
    if raw.len() != EXPECTED_ENTRIES {
        return Err(ParseError::Missing {
            expected: EXPECTED_ENTRIES,
            actual: raw.len(),
        });
    }

    let detail = required_payload(raw, IDX_DETAIL)?;
    let (flexibility_state, flexibility_available) = parse_flexibility_state(detail)?;
    let control_mode = detail
        .get("controlMode")
        .and_then(Value::as_str)
        .and_then(|mode| mode.parse::<ControlMode>().ok())
        .ok_or_else(|| malformed(IDX_DETAIL, "controlMode"))?;
    let control_enabled = detail
        .get("controlEnabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| malformed(IDX_DETAIL, "controlEnabled"))?;

    let rewards = parse_rewards(required_payload(raw, IDX_REWARDS)?)?;

    let controls = required_payload(raw, IDX_CONTROLS)?;
    let manual_controls = parse_manual_controls(controls)?;
    let flexibility_capabilities = parse_capabilities(controls)?;

    let (active_command, command_end) = parse_command(required_payload(raw, IDX_COMMAND)?)?;

    let forecast = parse_forecast(raw.get(IDX_STEP));

    Ok(Snapshot {
        flexibility_state,
        flexibility_available,
        control_mode,
        control_enabled,
        rewards,
        manual_controls,
        flexibility_capabilities,
        active_command,
        command_end,
        forecast,
    })
}

fn required_payload(raw: &BatchResponse, index: usize) -> Result<&Value, ParseError> {
    match raw.get(index) {
        Some(BatchEntry::Success(result)) => result
            .pointer("/data/json")
            .filter(|json| json.is_object())
            .ok_or_else(|| malformed(index, "result.data.json")),
        Some(BatchEntry::Error(error)) => {
            warn!("⚠️ [PROTEUS RPC] Batch entry {} failed: {}", index, error);
            Err(malformed(index, "result"))
        }
        None => Err(malformed(index, "result")),
    }
}

fn parse_flexibility_state(detail: &Value) -> Result<(String, bool), ParseError> {
    match detail.pointer("/household/flexibilityState") {
        Some(Value::String(state)) => Ok((state.clone(), state == "AVAILABLE")),
        Some(Value::Bool(available)) => {
            let state = if *available { "AVAILABLE" } else { "UNAVAILABLE" };
            Ok((state.to_owned(), *available))
        }
        _ => Err(malformed(IDX_DETAIL, "household.flexibilityState")),
    }
}

fn parse_rewards(rewards: &Value) -> Result<FlexibilityRewards, ParseError> {
    let amount = |field: &str| {
        rewards
            .get(field)
            .and_then(Value::as_f64)
            .map(round_money)
            .ok_or_else(|| malformed(IDX_REWARDS, field))
    };

    Ok(FlexibilityRewards {
        today: amount("todayWithVat")?,
        month_to_date: amount("monthToDateWithVat")?,
        total: amount("totalWithVat")?,
    })
}

fn parse_manual_controls(controls: &Value) -> Result<BTreeMap<ControlType, bool>, ParseError> {
    let entries = controls
        .get("manualControls")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(IDX_CONTROLS, "manualControls"))?;

    let mut states: BTreeMap<ControlType, bool> =
        ControlType::all().iter().map(|t| (*t, false)).collect();

    for entry in entries {
        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(IDX_CONTROLS, "manualControls.type"))?;
        let state = entry
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(IDX_CONTROLS, "manualControls.state"))?;

        match kind.parse::<ControlType>() {
            Ok(control_type) => {
                states.insert(control_type, state == "ENABLED");
            }
            Err(_) => debug!("Ignoring unknown manual control type {}", kind),
        }
    }

    Ok(states)
}

fn parse_capabilities(controls: &Value) -> Result<Vec<String>, ParseError> {
    controls
        .get("flexibilityCapabilitiesEnabled")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(IDX_CONTROLS, "flexibilityCapabilitiesEnabled"))?
        .iter()
        .map(|capability| {
            capability
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| malformed(IDX_CONTROLS, "flexibilityCapabilitiesEnabled"))
        })
        .collect()
}

fn parse_command(
    command_data: &Value,
) -> Result<(ActiveCommand, Option<DateTime<Utc>>), ParseError> {
    let command = match command_data.get("command") {
        None | Some(Value::Null) => return Ok((ActiveCommand::None, None)),
        Some(command) => command,
    };

    let kind = command
        .get("type")
        .and_then(Value::as_str)
        .filter(|kind| !kind.is_empty())
        .ok_or_else(|| malformed(IDX_COMMAND, "command.type"))?;
    let end = command
        .get("endAt")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| malformed(IDX_COMMAND, "command.endAt"))?;

    Ok((ActiveCommand::Active(kind.to_owned()), Some(end)))
}

/// RFC 3339, or naive ISO 8601 taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_forecast(entry: Option<&BatchEntry>) -> ForecastMetadata {
    let metadata = match entry {
        Some(BatchEntry::Success(result)) => result.pointer("/data/json/metadata"),
        Some(BatchEntry::Error(error)) => {
            warn!("⚠️ [PROTEUS RPC] Current step unavailable: {}", error);
            None
        }
        None => None,
    };
    let Some(metadata) = metadata.filter(|m| m.is_object()) else {
        return ForecastMetadata::default();
    };

    let text = |field: &str| metadata.get(field).and_then(Value::as_str).map(str::to_owned);
    let number = |field: &str| metadata.get(field).and_then(Value::as_f64);

    ForecastMetadata {
        flexalgo_battery: text("flexalgoBattery"),
        flexalgo_battery_fallback: text("flexalgoBatteryFallback"),
        flexalgo_pv: text("flexalgoPv"),
        target_soc: number("targetSoC"),
        predicted_production: number("predictedProduction"),
        predicted_consumption: number("predictedConsumption"),
    }
}
