use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::MonitorConfig;
use crate::storage::sql::Dialect;

/// Configuration loaded from `flowwatch.yaml`.
/// All fields are optional; missing fields fall back to CLI, env or defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FlowWatchConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_url: Option<String>,
    /// Redis URL for the shared lock service. In-process locks are used when absent.
    pub redis_url: Option<String>,
    pub dialect: Option<Dialect>,
    pub locking_enabled: Option<bool>,
    pub hints_enabled: Option<bool>,
    pub lock_hold_timeout_ms: Option<u64>,
    pub lock_wait_timeout_ms: Option<u64>,
    pub lock_acquire_deadline_ms: Option<u64>,
    /// Set to false on clustered databases where ordering by id is expensive.
    pub order_by_workflow_id: Option<bool>,
    pub optimizer_hints: Option<bool>,
    pub max_to_display: Option<usize>,
    pub status_batch_size: Option<usize>,
    pub fetch_size: Option<usize>,
}

impl FlowWatchConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `flowwatch.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("flowwatch.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: FlowWatchConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Monitor settings with defaults filled in. The dialect falls back to
    /// the one implied by `database_url`; `build_monitor` replaces it with
    /// the dialect of the store it connects.
    pub fn monitor_config(&self) -> MonitorConfig {
        let defaults = MonitorConfig::default();
        MonitorConfig {
            dialect: self
                .dialect
                .or_else(|| self.database_url.as_deref().map(Dialect::from_url))
                .unwrap_or(defaults.dialect),
            locking_enabled: self.locking_enabled.unwrap_or(defaults.locking_enabled),
            hints_enabled: self.hints_enabled.unwrap_or(defaults.hints_enabled),
            lock_hold_timeout_ms: self.lock_hold_timeout_ms.unwrap_or(defaults.lock_hold_timeout_ms),
            lock_wait_timeout_ms: self.lock_wait_timeout_ms.unwrap_or(defaults.lock_wait_timeout_ms),
            lock_acquire_deadline_ms: self.lock_acquire_deadline_ms.or(defaults.lock_acquire_deadline_ms),
            order_by_workflow_id: self.order_by_workflow_id.unwrap_or(defaults.order_by_workflow_id),
            optimizer_hints: self.optimizer_hints.unwrap_or(defaults.optimizer_hints),
            max_to_display: self.max_to_display.unwrap_or(defaults.max_to_display),
            status_batch_size: self.status_batch_size.unwrap_or(defaults.status_batch_size),
            fetch_size: self.fetch_size.unwrap_or(defaults.fetch_size),
        }
    }
}
