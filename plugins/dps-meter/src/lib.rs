//! DPS Meter Plugin
//!
//! Tracks damage events per combatant and reports damage per second over the
//! active encounter. The last encounter summary is persisted to the plugin's
//! storage directory on disable and restored on initialize.
//!
//! Built as a native plugin library; the host finds it through the exported
//! `bulwark_plugin_declaration`.

use async_trait::async_trait;
use bulwark_sdk::{abi, export_plugins, LogHandle, Permission, Plugin, PluginContext, PluginError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

const SUMMARY_FILE: &str = "last_encounter.json";

/// One parsed damage line from the combat log
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DamageEvent {
    /// Milliseconds since the start of the log
    pub timestamp_ms: u64,
    pub source: String,
    pub amount: u64,
}

/// Per-combatant totals for one encounter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterSummary {
    pub duration_ms: u64,
    pub damage: BTreeMap<String, u64>,
}

impl EncounterSummary {
    /// Damage per second for `source`; zero for an empty encounter
    pub fn dps(&self, source: &str) -> f64 {
        let damage = self.damage.get(source).copied().unwrap_or(0);
        if self.duration_ms == 0 {
            return 0.0;
        }
        damage as f64 * 1000.0 / self.duration_ms as f64
    }

    /// Combatants ordered by total damage, highest first
    pub fn ranking(&self) -> Vec<(&str, u64)> {
        let mut ranking: Vec<(&str, u64)> =
            self.damage.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranking.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranking
    }
}

#[derive(Default)]
pub struct DpsMeter {
    log: LogHandle,
    storage: Option<PathBuf>,
    can_read_logs: bool,
    enabled: bool,
    first_ms: Option<u64>,
    last_ms: u64,
    current: EncounterSummary,
    previous: Option<EncounterSummary>,
}

impl DpsMeter {
    /// Feed one damage event; ignored while disabled or without log access
    pub fn record(&mut self, event: &DamageEvent) {
        if !self.enabled || !self.can_read_logs {
            return;
        }
        let first = *self.first_ms.get_or_insert(event.timestamp_ms);
        self.last_ms = self.last_ms.max(event.timestamp_ms);
        self.current.duration_ms = self.last_ms.saturating_sub(first);
        let total = self.current.damage.entry(event.source.clone()).or_insert(0);
        *total = total.saturating_add(event.amount);
    }

    pub fn current(&self) -> &EncounterSummary {
        &self.current
    }

    /// Summary restored from the previous session, if any
    pub fn previous(&self) -> Option<&EncounterSummary> {
        self.previous.as_ref()
    }

    fn summary_path(&self) -> Option<PathBuf> {
        self.storage.as_ref().map(|dir| dir.join(SUMMARY_FILE))
    }

    fn persist(&self) -> Result<(), PluginError> {
        let Some(path) = self.summary_path() else {
            return Ok(());
        };
        if self.current.damage.is_empty() {
            return Ok(());
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&self.current)?)?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for DpsMeter {
    fn kind(&self) -> bulwark_sdk::PluginKind {
        bulwark_sdk::PluginKind::DataAnalysis
    }

    async fn on_load(
        &mut self,
        ctx: &PluginContext,
        _cancel: &CancellationToken,
    ) -> Result<(), PluginError> {
        self.log = ctx.log().clone();
        self.storage = Some(ctx.storage_dir().to_path_buf());
        self.can_read_logs = ctx.has_permission(Permission::ReadLogs);
        if !self.can_read_logs {
            self.log
                .warn("read_logs not granted; the meter will stay empty");
        }
        Ok(())
    }

    async fn on_initialize(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if let Some(path) = self.summary_path().filter(|p| p.exists()) {
            match std::fs::read(&path)
                .map_err(PluginError::from)
                .and_then(|bytes| serde_json::from_slice::<EncounterSummary>(&bytes).map_err(PluginError::from))
            {
                Ok(summary) => self.previous = Some(summary),
                Err(e) => self
                    .log
                    .warn(&format!("ignoring unreadable {}: {}", SUMMARY_FILE, e)),
            }
        }
        Ok(())
    }

    async fn on_enable(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        self.enabled = true;
        self.log.info("DPS meter enabled");
        Ok(())
    }

    async fn on_disable(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        self.enabled = false;
        self.persist()
    }

    fn dispose(&mut self) {
        self.current = EncounterSummary::default();
        self.previous = None;
    }
}

export_plugins! {
    "DpsMeter" => abi::default_factory::<DpsMeter>,
}
