//! Security audit stream
//!
//! Every verification decision and every lifecycle transition is recorded as
//! an [`AuditEvent`] and handed to an [`AuditSink`]. The audit trail is the
//! forensic record of why a plugin was trusted, rejected, loaded or removed,
//! so sinks are append-only and must never drop an event silently.
//!
//! # Sinks
//!
//! - [`TracingAuditSink`] - emits every event under the `audit` tracing target
//! - [`MemoryAuditSink`] - keeps events in memory for queries and tests
//! - [`JsonlAuditSink`] - appends one JSON object per line to a file
//! - [`FanoutAuditSink`] - forwards each event to several sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Content hash of an entry binary was computed
    HashComputed,
    /// Entry binary carries no signature
    Unsigned,
    /// Signature and chain are valid
    SignatureValid,
    /// Signature or chain failed validation
    SignatureInvalid,
    /// Signer does not match the manifest's expected thumbprint
    ThumbprintMismatch,
    /// Valid signature by a signer on neither allow-list
    UntrustedSigner,
    /// Verification could not complete
    VerificationFailed,
    /// Load refused by security policy
    LoadRejected,
    /// Plugin attempted to use a denied module or native library
    SecurityViolation,
    PermissionsGranted,
    Loaded,
    Initialized,
    Enabled,
    Disabled,
    Unloaded,
    LoadFailed,
    Installed,
}

impl AuditEventKind {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::HashComputed => "hash_computed",
            AuditEventKind::Unsigned => "unsigned",
            AuditEventKind::SignatureValid => "signature_valid",
            AuditEventKind::SignatureInvalid => "signature_invalid",
            AuditEventKind::ThumbprintMismatch => "thumbprint_mismatch",
            AuditEventKind::UntrustedSigner => "untrusted_signer",
            AuditEventKind::VerificationFailed => "verification_failed",
            AuditEventKind::LoadRejected => "load_rejected",
            AuditEventKind::SecurityViolation => "security_violation",
            AuditEventKind::PermissionsGranted => "permissions_granted",
            AuditEventKind::Loaded => "loaded",
            AuditEventKind::Initialized => "initialized",
            AuditEventKind::Enabled => "enabled",
            AuditEventKind::Disabled => "disabled",
            AuditEventKind::Unloaded => "unloaded",
            AuditEventKind::LoadFailed => "load_failed",
            AuditEventKind::Installed => "installed",
        }
    }

    /// Kinds that describe a security decision rather than a lifecycle step
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            AuditEventKind::Unsigned
                | AuditEventKind::SignatureInvalid
                | AuditEventKind::ThumbprintMismatch
                | AuditEventKind::UntrustedSigner
                | AuditEventKind::VerificationFailed
                | AuditEventKind::LoadRejected
                | AuditEventKind::SecurityViolation
        )
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub plugin_id: String,
    pub kind: AuditEventKind,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(plugin_id: &str, kind: AuditEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin_id: plugin_id.to_string(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Append-only destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Convenience helpers on shared sinks
pub trait AuditSinkExt {
    fn emit(&self, plugin_id: &str, kind: AuditEventKind, detail: impl Into<String>);
}

impl AuditSinkExt for Arc<dyn AuditSink> {
    fn emit(&self, plugin_id: &str, kind: AuditEventKind, detail: impl Into<String>) {
        self.record(AuditEvent::new(plugin_id, kind, detail));
    }
}

/// Emits audit events through `tracing` under the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        if event.kind.is_security() {
            tracing::warn!(
                target: "audit",
                plugin = %event.plugin_id,
                kind = %event.kind,
                "{}",
                event.detail
            );
        } else {
            tracing::info!(
                target: "audit",
                plugin = %event.plugin_id,
                kind = %event.kind,
                "{}",
                event.detail
            );
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded event, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().clone()
    }

    /// Events recorded for one plugin
    pub fn events_for(&self, plugin_id: &str) -> Vec<AuditEvent> {
        self.lock()
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    /// Number of events of `kind` recorded for `plugin_id`
    pub fn count(&self, plugin_id: &str, kind: AuditEventKind) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.plugin_id == plugin_id && e.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEvent>> {
        // A poisoned audit log is still the audit log
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.lock().push(event);
    }
}

/// Appends events as JSON lines to a file
///
/// A failed write is reported at error level together with the full event,
/// so the record survives in the process log.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open (or create) the audit file in append mode
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the file
    /// cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write_line(&event) {
            tracing::error!(
                target: "audit",
                path = %self.path.display(),
                error = %e,
                event = ?event,
                "Failed to append audit event"
            );
        }
    }
}

/// Forwards every event to each inner sink in order
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts_by_kind() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::new("a", AuditEventKind::Unsigned, "no signature"));
        sink.record(AuditEvent::new("a", AuditEventKind::LoadRejected, "unsigned"));
        sink.record(AuditEvent::new("b", AuditEventKind::Unsigned, "no signature"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count("a", AuditEventKind::Unsigned), 1);
        assert_eq!(sink.events_for("b").len(), 1);
    }

    #[test]
    fn test_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&AuditEventKind::ThumbprintMismatch).unwrap();
        assert_eq!(json, "\"thumbprint_mismatch\"");
        assert_eq!(AuditEventKind::Unsigned.to_string(), "unsigned");
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::new("a", AuditEventKind::Loaded, "ok"));
        sink.record(AuditEvent::new("a", AuditEventKind::Enabled, "ok"));
        drop(sink);

        // Reopening appends rather than truncating
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::new("a", AuditEventKind::Unloaded, "ok"));

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<AuditEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].kind, AuditEventKind::Unloaded);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(MemoryAuditSink::new());
        let second = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![
            first.clone() as Arc<dyn AuditSink>,
            second.clone() as Arc<dyn AuditSink>,
        ]);

        fanout.record(AuditEvent::new("a", AuditEventKind::Installed, "copied"));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
