//! Push channel wire schema
//!
//! Every server event is a JSON text frame `{"event": <name>, "data": {..}}`.
//! Each event kind has its own payload type and, where it touches cached
//! state, its own merge function. Objects keep the fields this crate
//! doesn't model in `extra`, so a merge never drops data it didn't read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Server timestamps arrive either as RFC 3339 strings or epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
  Iso(DateTime<Utc>),
  Millis(i64),
}

impl Timestamp {
  pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
    match self {
      Timestamp::Iso(dt) => Some(*dt),
      Timestamp::Millis(ms) => DateTime::from_timestamp_millis(*ms),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
  Up,
  Down,
}

impl ServiceStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ServiceStatus::Up => "up",
      ServiceStatus::Down => "down",
    }
  }
}

impl std::fmt::Display for ServiceStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
  #[serde(default)]
  pub status: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub services: BTreeMap<String, ServiceHealth>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Health {
  /// Flip the status of a known service. Unknown services are left
  /// alone; returns whether anything changed.
  pub fn apply_alert(&mut self, alert: &ServiceAlert) -> bool {
    match self.services.get_mut(&alert.service) {
      Some(service) if service.status != alert.status.as_str() => {
        service.status = alert.status.as_str().to_string();
        true
      }
      _ => false,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub usage: Option<Number>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
  #[serde(
    rename = "usagePercent",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub usage_percent: Option<Number>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetrics {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub uptime: Option<Number>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpu: Option<CpuMetrics>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub memory: Option<MemoryMetrics>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub application: Option<ApplicationMetrics>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl SystemMetrics {
  /// Fold a `quickMetrics` sample in: only cpu usage, memory percentage
  /// and uptime change.
  pub fn merge_quick(&mut self, quick: &QuickMetrics) {
    self.cpu.get_or_insert_with(Default::default).usage = Some(quick.cpu.clone());
    self
      .memory
      .get_or_insert_with(Default::default)
      .usage_percent = Some(quick.memory.clone());
    self.application.get_or_insert_with(Default::default).uptime = Some(quick.uptime.clone());
  }
}

/// What the channel caches under its metrics key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  #[serde(default)]
  pub health: Health,
  #[serde(default)]
  pub metrics: SystemMetrics,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<Timestamp>,
}

impl MetricsSnapshot {
  pub fn from_value(value: &Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }

  pub fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
  #[serde(default)]
  pub health: Health,
  #[serde(default)]
  pub metrics: SystemMetrics,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickMetrics {
  pub cpu: Number,
  pub memory: Number,
  pub uptime: Number,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAlert {
  pub service: String,
  pub status: ServiceStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
  Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
  #[serde(default)]
  pub stats: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action: Option<SessionAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
  Running,
  Completed,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
  pub status: BackupStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperationProgress {
  #[serde(rename = "type")]
  pub kind: String,
  pub completed: u64,
  pub total: u64,
}

impl BulkOperationProgress {
  pub fn percent(&self) -> f64 {
    if self.total == 0 {
      100.0
    } else {
      self.completed as f64 * 100.0 / self.total as f64
    }
  }

  pub fn is_done(&self) -> bool {
    self.completed >= self.total
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialData {
  #[serde(default)]
  pub health: Health,
  #[serde(default)]
  pub metrics: SystemMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
  pub message: String,
}

/// Server-initiated events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PushEvent {
  MetricsUpdate(MetricsUpdate),
  QuickMetrics(QuickMetrics),
  ServiceAlert(ServiceAlert),
  SessionUpdate(SessionUpdate),
  BackupProgress(BackupProgress),
  BulkOperationProgress(BulkOperationProgress),
  InitialData(InitialData),
  Error(ServerError),
}

impl PushEvent {
  pub fn name(&self) -> &'static str {
    match self {
      PushEvent::MetricsUpdate(_) => "metricsUpdate",
      PushEvent::QuickMetrics(_) => "quickMetrics",
      PushEvent::ServiceAlert(_) => "serviceAlert",
      PushEvent::SessionUpdate(_) => "sessionUpdate",
      PushEvent::BackupProgress(_) => "backupProgress",
      PushEvent::BulkOperationProgress(_) => "bulkOperationProgress",
      PushEvent::InitialData(_) => "initialData",
      PushEvent::Error(_) => "error",
    }
  }
}

/// Client-initiated events (no payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
  RefreshMetrics,
  RefreshSessions,
  RequestInitialData,
}

/// UI-only side effects of push events. Nothing here is cached.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
  ServiceAlert(ServiceAlert),
  SessionTerminated(Value),
  Backup(BackupProgress),
  BulkProgress(BulkOperationProgress),
  ServerError(String),
}

/// Merge a `quickMetrics` sample into the cached snapshot value.
pub fn merge_quick_metrics(current: Option<&Value>, quick: &QuickMetrics) -> Option<Value> {
  let mut snapshot = MetricsSnapshot::from_value(current?)?;
  snapshot.metrics.merge_quick(quick);
  if quick.timestamp.is_some() {
    snapshot.timestamp = quick.timestamp.clone();
  }
  Some(snapshot.to_value())
}

/// Flip a service status inside the cached snapshot value. `None` when
/// nothing is cached or the service is unknown.
pub fn merge_service_alert(current: Option<&Value>, alert: &ServiceAlert) -> Option<Value> {
  let mut snapshot = MetricsSnapshot::from_value(current?)?;
  if snapshot.health.apply_alert(alert) {
    Some(snapshot.to_value())
  } else {
    None
  }
}
