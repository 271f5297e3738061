//! Runtime configuration, deserialised from `config.toml` layered with
//! `COVENANT_*` environment variables.
//!
//! Nested keys use `__` in the environment, e.g.
//! `COVENANT_GRACE__PERIOD_HOURS=48`.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use chrono::TimeDelta;
use covenant_core::{
  invariant::{GracePolicy, InvariantPolicy},
  ledger::FeeSchedule,
};
use covenant_engine::{EngineConfig, retry::RetryPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub host:       String,
  pub port:       u16,
  pub store_path: PathBuf,
  pub grace:      GraceSettings,
  pub fees:       FeeSettings,
  pub projector:  ProjectorSettings,
  pub evaluator:  EvaluatorSettings,
  pub retry:      RetrySettings,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:       "127.0.0.1".into(),
      port:       8080,
      store_path: PathBuf::from("covenant.db"),
      grace:      GraceSettings::default(),
      fees:       FeeSettings::default(),
      projector:  ProjectorSettings::default(),
      evaluator:  EvaluatorSettings::default(),
      retry:      RetrySettings::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraceSettings {
  pub period_hours:    u32,
  pub sla_slack_hours: u32,
}

impl Default for GraceSettings {
  fn default() -> Self { Self { period_hours: 72, sla_slack_hours: 4 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeeSettings {
  pub platform_bps: u32,
  pub fixed_cents:  i64,
}

impl Default for FeeSettings {
  fn default() -> Self { Self { platform_bps: 500, fixed_cents: 30 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectorSettings {
  pub batch_size:       usize,
  pub poll_interval_ms: u64,
}

impl Default for ProjectorSettings {
  fn default() -> Self { Self { batch_size: 500, poll_interval_ms: 250 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
  pub interval_secs:   u64,
  pub ledger_lag_secs: u64,
}

impl Default for EvaluatorSettings {
  fn default() -> Self { Self { interval_secs: 60, ledger_lag_secs: 60 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub max_delay_ms:  u64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self { max_attempts: 5, base_delay_ms: 20, max_delay_ms: 1000 }
  }
}

impl ServerConfig {
  /// Read `path` if it exists, then apply `COVENANT_*` overrides.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("COVENANT")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()
      .with_context(|| format!("failed to read config from {}", path.display()))?;
    settings
      .try_deserialize()
      .context("failed to deserialise ServerConfig")
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn projector_poll(&self) -> Duration {
    Duration::from_millis(self.projector.poll_interval_ms)
  }

  pub fn evaluator_interval(&self) -> Duration {
    Duration::from_secs(self.evaluator.interval_secs)
  }

  /// Fails when a duration setting does not fit a [`TimeDelta`].
  pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
    let ledger_lag = i64::try_from(self.evaluator.ledger_lag_secs)
      .ok()
      .and_then(TimeDelta::try_seconds)
      .with_context(|| {
        format!(
          "evaluator.ledger_lag_secs = {} is out of range",
          self.evaluator.ledger_lag_secs
        )
      })?;
    Ok(EngineConfig {
      fees:       FeeSchedule {
        platform_bps: self.fees.platform_bps,
        fixed_cents:  self.fees.fixed_cents,
      },
      invariants: InvariantPolicy {
        grace: GracePolicy {
          period:    hours("grace.period_hours", self.grace.period_hours)?,
          sla_slack: hours("grace.sla_slack_hours", self.grace.sla_slack_hours)?,
        },
        ledger_lag,
      },
      retry:      RetryPolicy {
        max_attempts: self.retry.max_attempts.max(1),
        base_delay:   Duration::from_millis(self.retry.base_delay_ms),
        max_delay:    Duration::from_millis(self.retry.max_delay_ms),
      },
      batch_size: self.projector.batch_size,
    })
  }
}

fn hours(key: &str, value: u32) -> anyhow::Result<TimeDelta> {
  TimeDelta::try_hours(value.into())
    .with_context(|| format!("{key} = {value} is out of range"))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use config::{Config, File, FileFormat};

  use super::*;

  fn parse(toml: &str) -> ServerConfig {
    Config::builder()
      .add_source(File::from_str(toml, FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn defaults_match_engine_defaults() {
    let cfg = ServerConfig::default();
    assert_eq!(cfg.engine_config().unwrap(), EngineConfig::default());
    assert_eq!(parse(""), cfg);
  }

  #[test]
  fn nested_sections_override_defaults() {
    let cfg = parse(
      r#"
        port = 9000
        [grace]
        period_hours = 48
        [fees]
        platform_bps = 250
      "#,
    );
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.grace.sla_slack_hours, 4);

    let engine = cfg.engine_config().unwrap();
    assert_eq!(engine.invariants.grace.period, chrono::Duration::hours(48));
    assert_eq!(engine.fees.platform_bps, 250);
    assert_eq!(engine.fees.fixed_cents, 30);
  }

  #[test]
  fn oversized_durations_are_rejected() {
    let cfg = parse(
      r#"
        [evaluator]
        ledger_lag_secs = 9223372036854775807
      "#,
    );
    let err = cfg.engine_config().unwrap_err();
    assert!(err.to_string().contains("ledger_lag_secs"));

    let mut cfg = ServerConfig::default();
    cfg.evaluator.ledger_lag_secs = u64::MAX;
    assert!(cfg.engine_config().is_err());

    let mut cfg = ServerConfig::default();
    cfg.grace.period_hours = u32::MAX;
    assert!(cfg.engine_config().is_ok());
  }

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let cfg = ServerConfig::load(Path::new("/nonexistent/covenant.toml")).unwrap();
    assert_eq!(cfg.store_path, ServerConfig::default().store_path);
  }
}
