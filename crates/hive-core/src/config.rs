//! HiveConfig - 設定の読み込み
//!
//! 優先順位: デフォルト < JSON ファイル < 環境変数 < CLI フラグ（CLI 側で上書き）。
//! すべてのフィールドにデフォルトがあるので、ファイルは部分的でよい。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{DEFAULT_COMPLETION_MARKERS, LoopConfig, OrchestratorConfig};
use crate::domain::HiveError;
use crate::lease::{AuthPolicy, LeaseSettings};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub coordinator: CoordinatorSection,
    pub client: ClientSection,
    pub scheduler: SchedulerSection,
    pub execution: ExecutionSection,
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub host: String,
    pub port: u16,
    pub require_auth: bool,
    pub api_key: Option<String>,
    pub default_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            require_auth: false,
            api_key: None,
            default_ttl_secs: 3600,
            min_ttl_secs: 1,
            max_ttl_secs: 86_400,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// None disables the coordinator; claims use the owner field only.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub retry_count: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 5,
            retry_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_dispatches: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { max_dispatches: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_iterations: u32,
    pub timeout_secs: u64,
    pub iteration_timeout_secs: u64,
    pub cooldown_secs: u64,
    pub rate_limit_per_hour: u32,
    pub rate_limit_backoff_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub completion_markers: Vec<String>,
    pub history_limit: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            timeout_secs: 3600,
            iteration_timeout_secs: 900,
            cooldown_secs: 5,
            rate_limit_per_hour: 100,
            rate_limit_backoff_secs: 60,
            circuit_breaker_threshold: 5,
            completion_markers: DEFAULT_COMPLETION_MARKERS.map(String::from).to_vec(),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_parallel: usize,
    pub deadline_secs: u64,
    pub stop_grace_secs: u64,
    pub holder: String,
    pub lease_ttl_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            deadline_secs: 14_400,
            stop_grace_secs: 30,
            holder: "hive".to_string(),
            lease_ttl_secs: 3600,
        }
    }
}

impl HiveConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, HiveError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    HiveError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    HiveError::Config(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => HiveConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `lookup` is injected so tests don't touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), HiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("COORDINATOR_HOST") {
            self.coordinator.host = host;
        }
        if let Some(port) = lookup("COORDINATOR_PORT") {
            self.coordinator.port = port
                .parse()
                .map_err(|_| HiveError::Config(format!("COORDINATOR_PORT is not a port: {port}")))?;
        }
        if let Some(flag) = lookup("HIVE_REQUIRE_AUTH") {
            self.coordinator.require_auth = parse_flag(&flag).ok_or_else(|| {
                HiveError::Config(format!("HIVE_REQUIRE_AUTH is not a boolean: {flag}"))
            })?;
        }
        if let Some(key) = lookup("HIVE_API_KEY").filter(|k| !k.is_empty()) {
            self.coordinator.api_key = Some(key.clone());
            self.client.api_key = Some(key);
        }
        if let Some(url) = lookup("COORDINATOR_URL").filter(|u| !u.is_empty()) {
            self.client.url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        let c = &self.coordinator;
        if c.min_ttl_secs == 0 {
            return Err(HiveError::Config("coordinator.min_ttl_secs must be > 0".into()));
        }
        if c.min_ttl_secs > c.max_ttl_secs {
            return Err(HiveError::Config(format!(
                "coordinator ttl bounds are inverted: min {} > max {}",
                c.min_ttl_secs, c.max_ttl_secs
            )));
        }
        if !(c.min_ttl_secs..=c.max_ttl_secs).contains(&c.default_ttl_secs) {
            return Err(HiveError::Config(format!(
                "coordinator.default_ttl_secs {} is outside [{}, {}]",
                c.default_ttl_secs, c.min_ttl_secs, c.max_ttl_secs
            )));
        }

        let nonzero = [
            ("coordinator.sweep_interval_secs", c.sweep_interval_secs),
            ("client.timeout_secs", self.client.timeout_secs),
            ("scheduler.max_dispatches", self.scheduler.max_dispatches as u64),
            ("execution.max_iterations", self.execution.max_iterations.into()),
            ("execution.timeout_secs", self.execution.timeout_secs),
            ("execution.iteration_timeout_secs", self.execution.iteration_timeout_secs),
            ("execution.rate_limit_per_hour", self.execution.rate_limit_per_hour.into()),
            ("execution.rate_limit_backoff_secs", self.execution.rate_limit_backoff_secs),
            (
                "execution.circuit_breaker_threshold",
                self.execution.circuit_breaker_threshold.into(),
            ),
            ("execution.history_limit", self.execution.history_limit as u64),
            ("orchestrator.max_parallel", self.orchestrator.max_parallel as u64),
            ("orchestrator.deadline_secs", self.orchestrator.deadline_secs),
            ("orchestrator.lease_ttl_secs", self.orchestrator.lease_ttl_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(HiveError::Config(format!("{name} must be > 0")));
        }
        if self.orchestrator.holder.trim().is_empty() {
            return Err(HiveError::Config("orchestrator.holder must not be empty".into()));
        }
        Ok(())
    }

    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            default_ttl: Duration::from_secs(self.coordinator.default_ttl_secs),
            min_ttl: Duration::from_secs(self.coordinator.min_ttl_secs),
            max_ttl: Duration::from_secs(self.coordinator.max_ttl_secs),
        }
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy::new(
            self.coordinator.require_auth,
            self.coordinator.api_key.as_deref(),
        )
    }

    pub fn loop_config(&self) -> LoopConfig {
        let e = &self.execution;
        LoopConfig {
            max_iterations: e.max_iterations,
            timeout: Duration::from_secs(e.timeout_secs),
            iteration_timeout: Duration::from_secs(e.iteration_timeout_secs),
            cooldown: Duration::from_secs(e.cooldown_secs),
            rate_limit_per_hour: e.rate_limit_per_hour,
            rate_limit_backoff: Duration::from_secs(e.rate_limit_backoff_secs),
            circuit_breaker_threshold: e.circuit_breaker_threshold,
            completion_markers: e.completion_markers.clone(),
            history_limit: e.history_limit,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallel: self.orchestrator.max_parallel,
            deadline: Duration::from_secs(self.orchestrator.deadline_secs),
            stop_grace: Duration::from_secs(self.orchestrator.stop_grace_secs),
            holder: self.orchestrator.holder.clone(),
            loop_config: self.loop_config(),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.orchestrator.lease_ttl_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
