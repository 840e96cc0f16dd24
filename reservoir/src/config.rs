// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains [`ReservoirConfig`], the runtime-adjustable settings of a
//! [`ReservoirManager`](crate::ReservoirManager).

/// Default number of events retained per application and event type.
pub const DEFAULT_MAX_SAMPLES_STORED: usize = 2000;

/// Default time between two passes of a [`Harvester`](crate::Harvester).
pub const DEFAULT_HARVEST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Settings for one event type, typically read from the agent configuration and re-applied whenever
/// it changes with [`ReservoirManager::apply_config`](crate::ReservoirManager::apply_config).
///
/// With the `serde` feature, this can be deserialized from any serde format. Missing fields take
/// their default, unknown fields and negative capacities are rejected.
///
/// ```
/// # use reservoir::config::ReservoirConfig;
/// let config: ReservoirConfig = serde_json::from_str(r#"{"max_samples_stored": 500}"#).unwrap();
/// assert!(config.enabled);
/// assert_eq!(config.max_samples_stored, 500);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(default, deny_unknown_fields)
)]
pub struct ReservoirConfig {
    /// Whether events of this type are collected at all
    pub enabled: bool,
    /// Capacity of reservoirs created from now on. Takes effect at the next harvest of each
    /// application.
    pub max_samples_stored: usize,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: DEFAULT_MAX_SAMPLES_STORED,
        }
    }
}
