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

//! Batch response fixtures shared by unit tests

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

/// Five-entry read response as the backend returns it
pub(crate) fn read_body(command: Option<(&str, DateTime<Utc>)>) -> Value {
    let command = command.map_or(Value::Null, |(kind, end)| {
        json!({
            "type": kind,
            "endAt": end.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    });

    json!([
        {"result": {"data": {"json": {
            "household": {"flexibilityState": "AVAILABLE"},
            "controlMode": "AUTOMATIC",
            "controlEnabled": true
        }}}},
        {"result": {"data": {"json": {
            "todayWithVat": 12.344,
            "monthToDateWithVat": 12.345,
            "totalWithVat": 1024.5
        }}}},
        {"result": {"data": {"json": {
            "manualControls": [
                {"type": "SAVING_TO_BATTERY", "state": "ENABLED"},
                {"type": "SELLING_FROM_BATTERY", "state": "DISABLED"}
            ],
            "flexibilityCapabilitiesEnabled": ["BATTERY", "PV"]
        }}}},
        {"result": {"data": {"json": {"command": command}}}},
        {"result": {"data": {"json": {"metadata": {
            "flexalgoBattery": "CHARGE",
            "flexalgoPv": "PRODUCE",
            "targetSoC": 80,
            "predictedProduction": 5200.5
        }}}}}
    ])
}
