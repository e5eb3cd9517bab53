// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Instrumentation configuration.
//!
//! The gateway hands every extension a loosely typed "extra config" document. This module
//! picks the sub-map stored under [`NAMESPACE`] and turns it into an
//! [`InstrumentationConfig`].
//!
//! ## Leniency
//!
//! - `license` and the application name are required strings. Anything else fails with
//!   [`ApmError::ConfigMalformed`].
//! - Every other field is optional. A field of the wrong type is logged at debug level and
//!   left at its default; resolution carries on.
//! - Nested groups (`transactionTracer`, `errorCollector`, ...) are resolved field by field.
//!   A group that is not a map falls back to the group default as a whole.
//! - `debug` only counts when it is literally `true`.
//! - `instrumentationRatePercent` is clamped to `0..=100`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::ApmError;

/// Key of the instrumentation settings inside the gateway's extra config.
pub const NAMESPACE: &str = "gateway_apm";

/// Highest accepted instrumentation rate, in percent.
pub const MAX_INSTRUMENTATION_RATE: u8 = 100;

/// The gateway's free-form extension configuration.
pub type ExtraConfig = Map<String, Value>;

const LICENSE_KEYS: [&str; 1] = ["license"];
const APP_NAME_KEYS: [&str; 3] = ["applicationName", "appName", "appname"];

// (synonym, canonical key); the canonical key wins when both are present
const SYNONYMS: [(&str, &str); 2] = [
    ("rate", "instrumentationRatePercent"),
    ("debugEnabled", "debug"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentationConfig {
    pub license: String,
    pub app_name: String,
    /// Verbose diagnostics from the agent.
    pub debug: bool,
    /// Percentage of inbound requests that get a transaction.
    pub instrumentation_rate: u8,
    pub high_security: bool,
    pub host_display_name: String,
    pub labels: HashMap<String, String>,
    pub transaction_tracer: TransactionTracerConfig,
    pub error_collector: ErrorCollectorConfig,
    pub transaction_events: FeatureToggle,
    pub attributes: AttributesConfig,
    pub utilization: UtilizationConfig,
    pub distributed_tracer: FeatureToggle,
}

impl InstrumentationConfig {
    /// Resolves the configuration stored under [`NAMESPACE`].
    pub fn from_extra_config(extra: &ExtraConfig) -> Result<Self, ApmError> {
        resolve(extra, NAMESPACE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureToggle {
    #[serde(deserialize_with = "deserialize_or_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransactionTracerConfig {
    #[serde(deserialize_with = "deserialize_or_default")]
    pub enabled: bool,
    /// Transactions slower than this are reported as slow.
    #[serde(
        rename = "thresholdMs",
        deserialize_with = "deserialize_optional_duration_from_millis"
    )]
    pub threshold: Option<Duration>,
    #[serde(
        rename = "segmentThresholdMs",
        deserialize_with = "deserialize_optional_duration_from_millis"
    )]
    pub segment_threshold: Option<Duration>,
    #[serde(
        rename = "stackTraceThresholdMs",
        deserialize_with = "deserialize_optional_duration_from_millis"
    )]
    pub stack_trace_threshold: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorCollectorConfig {
    #[serde(deserialize_with = "deserialize_or_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub capture_events: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub ignore_status_codes: Vec<u16>,
}

impl ErrorCollectorConfig {
    /// Whether a response with this status should be reported as an error. Server errors
    /// are always reported, client errors unless ignored.
    pub fn is_error(&self, status: u16) -> bool {
        self.enabled
            && (status >= 500 || (status >= 400 && !self.ignore_status_codes.contains(&status)))
    }
}

/// Which request attributes are reported. Reporting is on unless `enabled` is literally
/// `false`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttributesConfig {
    #[serde(deserialize_with = "deserialize_bool_or_true")]
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub include: Vec<String>,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub exclude: Vec<String>,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl AttributesConfig {
    /// Exclusion wins over inclusion; an empty include list admits everything.
    pub fn admits(&self, attribute: &str) -> bool {
        if !self.enabled || self.exclude.iter().any(|a| a == attribute) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|a| a == attribute)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UtilizationConfig {
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_aws: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_azure: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_gcp: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_pcf: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_docker: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub detect_kubernetes: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub billing_hostname: String,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub logical_processors: u32,
    #[serde(deserialize_with = "deserialize_or_default")]
    pub total_ram_mib: u64,
}

/// Optional fields of the namespace map, before they are folded into
/// [`InstrumentationConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Tuning {
    #[serde(deserialize_with = "deserialize_or_default")]
    debug: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    instrumentation_rate_percent: Option<Number>,
    #[serde(deserialize_with = "deserialize_or_default")]
    high_security: bool,
    #[serde(deserialize_with = "deserialize_or_default")]
    host_display_name: String,
    #[serde(deserialize_with = "deserialize_or_default")]
    labels: HashMap<String, String>,
    #[serde(deserialize_with = "deserialize_or_default")]
    transaction_tracer: TransactionTracerConfig,
    #[serde(deserialize_with = "deserialize_or_default")]
    error_collector: ErrorCollectorConfig,
    #[serde(deserialize_with = "deserialize_or_default")]
    transaction_events: FeatureToggle,
    #[serde(deserialize_with = "deserialize_or_default")]
    attributes: AttributesConfig,
    #[serde(deserialize_with = "deserialize_or_default")]
    utilization: UtilizationConfig,
    #[serde(deserialize_with = "deserialize_or_default")]
    distributed_tracer: FeatureToggle,
}

/// Resolves the instrumentation settings stored under `namespace`.
pub fn resolve(extra: &ExtraConfig, namespace: &str) -> Result<InstrumentationConfig, ApmError> {
    let raw = extra
        .get(namespace)
        .ok_or_else(|| ApmError::ConfigNotFound(namespace.to_string()))?;

    let Value::Object(fields) = raw else {
        return Err(ApmError::ConfigMalformed(format!(
            "expected a map under namespace {namespace}, got: {raw}"
        )));
    };

    let license = required_string(fields, &LICENSE_KEYS)?;
    let app_name = required_string(fields, &APP_NAME_KEYS)?;

    let tuning: Tuning = serde_json::from_value(Value::Object(with_canonical_keys(fields)))
        .map_err(|err| ApmError::ConfigMalformed(err.to_string()))?;

    Ok(InstrumentationConfig {
        license,
        app_name,
        debug: tuning.debug,
        instrumentation_rate: clamp_rate(tuning.instrumentation_rate_percent.as_ref()),
        high_security: tuning.high_security,
        host_display_name: tuning.host_display_name,
        labels: tuning.labels,
        transaction_tracer: tuning.transaction_tracer,
        error_collector: tuning.error_collector,
        transaction_events: tuning.transaction_events,
        attributes: tuning.attributes,
        utilization: tuning.utilization,
        distributed_tracer: tuning.distributed_tracer,
    })
}

fn required_string(fields: &Map<String, Value>, keys: &[&str]) -> Result<String, ApmError> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|key| fields.get(*key).map(|value| (*key, value)))
    else {
        return Err(ApmError::ConfigMalformed(format!(
            "config should have the field {} defined",
            keys[0]
        )));
    };

    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(ApmError::ConfigMalformed(format!(
            "field {key} should be a string, got: {other}"
        ))),
    }
}

fn with_canonical_keys(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut fields = fields.clone();
    for (synonym, canonical) in SYNONYMS {
        if let Some(value) = fields.remove(synonym) {
            if !fields.contains_key(canonical) {
                fields.insert(canonical.to_string(), value);
            }
        }
    }
    fields
}

/// Saturates any JSON number into `0..=100`, however large or negative.
fn clamp_rate(rate: Option<&Number>) -> u8 {
    let max = u64::from(MAX_INSTRUMENTATION_RATE);
    let rate = match rate {
        None => 0,
        Some(n) => match (n.as_u64(), n.as_f64()) {
            (Some(rate), _) => rate.min(max),
            (None, Some(rate)) if rate > 0.0 => (rate as u64).min(max),
            _ => 0,
        },
    };
    u8::try_from(rate).unwrap_or(MAX_INSTRUMENTATION_RATE)
}

/// Deserializes a value, falling back to `T::default()` when it has an unexpected shape.
pub fn deserialize_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    match T::deserialize(value) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            debug!("Failed to parse instrumentation config value: {}, ignoring", e);
            Ok(T::default())
        }
    }
}

fn deserialize_bool_or_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(enabled) => Ok(enabled),
        other => {
            debug!("Failed to parse toggle: expected a bool, got {other}, ignoring");
            Ok(true)
        }
    }
}

pub fn deserialize_optional_duration_from_millis<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => match n.as_u64() {
            Some(ms) => Ok(Some(Duration::from_millis(ms))),
            None => {
                debug!("Failed to parse duration: expected milliseconds, got {n}, ignoring");
                Ok(None)
            }
        },
        other => {
            debug!("Failed to parse duration: expected milliseconds, got {other}, ignoring");
            Ok(None)
        }
    }
}
