use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to
/// nothing, and a `${` without a closing brace is kept as written.
fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut chars = input.chars().peekable();

  while let Some(c) = chars.next() {
    if c != '$' {
      result.push(c);
      continue;
    }

    if chars.peek() == Some(&'{') {
      let rest: String = chars.clone().skip(1).collect();
      match rest.find('}') {
        Some(end) => {
          result.push_str(&std::env::var(&rest[..end]).unwrap_or_default());
          // '{', the name, '}'
          for _ in 0..rest[..end].chars().count() + 2 {
            chars.next();
          }
        }
        None => result.push(c),
      }
      continue;
    }

    let mut name = String::new();
    while let Some(&next) = chars.peek() {
      if !(next.is_ascii_alphanumeric() || next == '_') {
        break;
      }
      name.push(next);
      chars.next();
    }
    if name.is_empty() {
      result.push(c);
    } else {
      result.push_str(&std::env::var(&name).unwrap_or_default());
    }
  }

  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwrConfig {
  #[serde(default)]
  pub cache: CacheSection,
  /// Defaults applied to every hook that doesn't pass its own options
  #[serde(default)]
  pub defaults: HookOptions,
  #[serde(default)]
  pub channel: ChannelSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Cache store lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
  /// How long an entry without subscribers is kept around for a fast
  /// remount (0 = drop on last unsubscribe)
  #[serde(default = "default_gc_grace_ms")]
  pub gc_grace_ms: u64,

  /// Interval between sweeps of orphaned entries
  #[serde(default = "default_gc_interval_ms")]
  pub gc_interval_ms: u64,
}

fn default_gc_grace_ms() -> u64 {
  300_000 // 5 minutes
}

fn default_gc_interval_ms() -> u64 {
  60_000
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      gc_grace_ms: default_gc_grace_ms(),
      gc_interval_ms: default_gc_interval_ms(),
    }
  }
}

impl CacheSection {
  pub fn gc_grace(&self) -> Duration {
    Duration::from_millis(self.gc_grace_ms)
  }

  pub fn gc_interval(&self) -> Duration {
    Duration::from_millis(self.gc_interval_ms)
  }
}

/// Per-hook options. Mirrors the options object a consumer passes when
/// it binds to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOptions {
  /// Connect the push channel as soon as a consumer attaches
  #[serde(default = "default_true")]
  pub auto_connect: bool,

  /// Poll over HTTP while the push channel is unavailable
  #[serde(default = "default_true")]
  pub fallback_to_polling: bool,

  #[serde(default = "default_true")]
  pub revalidate_on_focus: bool,

  #[serde(default = "default_true")]
  pub revalidate_on_reconnect: bool,

  /// Minimum time between automatic re-fetches of the same key
  #[serde(default = "default_deduping_interval_ms")]
  pub deduping_interval_ms: u64,

  /// Minimum time between focus-triggered revalidations of a key
  #[serde(default = "default_focus_throttle_interval_ms")]
  pub focus_throttle_interval_ms: u64,
}

fn default_true() -> bool {
  true
}

fn default_deduping_interval_ms() -> u64 {
  2000
}

fn default_focus_throttle_interval_ms() -> u64 {
  5000
}

impl Default for HookOptions {
  fn default() -> Self {
    Self {
      auto_connect: true,
      fallback_to_polling: true,
      revalidate_on_focus: true,
      revalidate_on_reconnect: true,
      deduping_interval_ms: default_deduping_interval_ms(),
      focus_throttle_interval_ms: default_focus_throttle_interval_ms(),
    }
  }
}

impl HookOptions {
  pub fn deduping_interval(&self) -> Duration {
    Duration::from_millis(self.deduping_interval_ms)
  }

  pub fn focus_throttle_interval(&self) -> Duration {
    Duration::from_millis(self.focus_throttle_interval_ms)
  }
}

/// Push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
  #[serde(default = "default_url")]
  pub url: String,

  /// Fallback polling interval while the channel is down
  #[serde(default = "default_polling_interval_ms")]
  pub polling_interval_ms: u64,

  /// First reconnect delay; doubles on every failed attempt
  #[serde(default = "default_reconnect_delay_ms")]
  pub reconnect_delay_ms: u64,

  #[serde(default = "default_max_reconnect_delay_ms")]
  pub max_reconnect_delay_ms: u64,

  #[serde(default)]
  pub keys: ChannelKeys,
}

/// Cache keys owned by the push channel. `metrics` holds the combined
/// health + metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeys {
  #[serde(default = "default_metrics_key")]
  pub metrics: String,
  #[serde(default = "default_sessions_key")]
  pub sessions: String,
}

fn default_url() -> String {
  "ws://localhost:3000/admin/metrics".into()
}
fn default_polling_interval_ms() -> u64 {
  15_000
}
fn default_reconnect_delay_ms() -> u64 {
  1000
}
fn default_max_reconnect_delay_ms() -> u64 {
  30_000
}
fn default_metrics_key() -> String {
  "admin:metrics".into()
}
fn default_sessions_key() -> String {
  "admin:sessions".into()
}

impl Default for ChannelKeys {
  fn default() -> Self {
    Self {
      metrics: default_metrics_key(),
      sessions: default_sessions_key(),
    }
  }
}

impl Default for ChannelSection {
  fn default() -> Self {
    Self {
      url: default_url(),
      polling_interval_ms: default_polling_interval_ms(),
      reconnect_delay_ms: default_reconnect_delay_ms(),
      max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
      keys: ChannelKeys::default(),
    }
  }
}

impl ChannelSection {
  pub fn polling_interval(&self) -> Duration {
    Duration::from_millis(self.polling_interval_ms)
  }

  pub fn reconnect_delay(&self) -> Duration {
    Duration::from_millis(self.reconnect_delay_ms)
  }

  pub fn max_reconnect_delay(&self) -> Duration {
    Duration::from_millis(self.max_reconnect_delay_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl SwrConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
    for p in ["swrcache.yaml", "swrcache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}
