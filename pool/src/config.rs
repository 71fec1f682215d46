use serde::Deserialize;
use std::time::Duration;

use crate::stratum::protocol::MAX_MESSAGE_SIZE;
use crate::sweeper::SweepConfig;
use crate::vardiff::VarDiffConfig;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub metrics_listen: String,
    pub redis_url: String,
    pub node_rpc_url: String,
    /// Sent verbatim as the RPC `Authorization` header.
    pub node_rpc_auth: Option<String>,
    pub template_poll_secs: u64,
    pub max_message_size: usize,
    /// Rejected shares tolerated before the connection is closed.
    pub invalid_share_limit: u32,
    /// Consecutive stale-job submissions tolerated before closing.
    pub job_mismatch_tolerance: u32,
    pub validation_timeout_ms: u64,
    pub max_concurrent_validations: usize,
    /// Share records kept per miner in Redis.
    pub share_retention: usize,
    pub vardiff: VarDiffConfig,
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".to_string(),
            metrics_listen: "0.0.0.0:9100".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            node_rpc_url: "http://127.0.0.1:42069".to_string(),
            node_rpc_auth: None,
            template_poll_secs: 10,
            max_message_size: MAX_MESSAGE_SIZE,
            invalid_share_limit: 8,
            job_mismatch_tolerance: 32,
            validation_timeout_ms: 10_000,
            max_concurrent_validations: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            share_retention: 10_000,
            vardiff: VarDiffConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(name) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!("Ignoring unparseable {}={}", name, v),
        }
    }
}

impl Config {
    /// Defaults, then `pool_config.json` (or `SHAI_POOL_CONFIG`), then
    /// `SHAI_*` environment overrides.
    pub fn load() -> Self {
        let path = std::env::var("SHAI_POOL_CONFIG").unwrap_or_else(|_| "pool_config.json".to_string());

        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(txt) => match Self::from_json(&txt) {
                Ok(file_cfg) => {
                    tracing::info!("Loaded pool config from {}", path);
                    file_cfg
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        cfg.apply_env();
        cfg.vardiff = cfg.vardiff.with_env_overrides();
        cfg.normalize();
        cfg
    }

    pub fn from_json(txt: &str) -> serde_json::Result<Self> {
        let mut cfg: Self = serde_json::from_str(txt)?;
        cfg.normalize();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(l) = std::env::var("SHAI_POOL_LISTEN") {
            self.listen = l;
        }
        if let Ok(m) = std::env::var("SHAI_POOL_METRICS") {
            self.metrics_listen = m;
        }
        if let Ok(r) = std::env::var("SHAI_REDIS_URL") {
            self.redis_url = r;
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            // legacy
            self.redis_url = r;
        }
        if let Ok(u) = std::env::var("SHAI_NODE_RPC") {
            self.node_rpc_url = u;
        }
        if let Ok(a) = std::env::var("SHAI_NODE_RPC_AUTH") {
            self.node_rpc_auth = Some(a).filter(|a| !a.is_empty());
        }
        env_parse("SHAI_TEMPLATE_POLL_SECS", &mut self.template_poll_secs);
        env_parse("SHAI_MAX_MESSAGE_SIZE", &mut self.max_message_size);
        env_parse("SHAI_INVALID_SHARE_LIMIT", &mut self.invalid_share_limit);
        env_parse("SHAI_JOB_MISMATCH_TOLERANCE", &mut self.job_mismatch_tolerance);
        env_parse("SHAI_VALIDATION_TIMEOUT_MS", &mut self.validation_timeout_ms);
        env_parse("SHAI_MAX_VALIDATIONS", &mut self.max_concurrent_validations);
        env_parse("SHAI_SHARE_RETENTION", &mut self.share_retention);
        env_parse("SHAI_SWEEP_SECS", &mut self.sweep.interval_secs);
    }

    /// Replace zero or nonsensical values with defaults.
    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.template_poll_secs == 0 {
            self.template_poll_secs = defaults.template_poll_secs;
        }
        if self.max_message_size == 0 {
            self.max_message_size = defaults.max_message_size;
        }
        if self.invalid_share_limit == 0 {
            self.invalid_share_limit = defaults.invalid_share_limit;
        }
        if self.validation_timeout_ms == 0 {
            self.validation_timeout_ms = defaults.validation_timeout_ms;
        }
        if self.max_concurrent_validations == 0 {
            self.max_concurrent_validations = defaults.max_concurrent_validations;
        }
        if !(self.vardiff.target_share_secs.is_finite() && self.vardiff.target_share_secs > 0.0) {
            self.vardiff.target_share_secs = defaults.vardiff.target_share_secs;
        }
        self.vardiff.window_size = self.vardiff.window_size.max(1);
        self.sweep.interval_secs = self.sweep.interval_secs.max(1);
    }

    pub fn template_poll_interval(&self) -> Duration {
        Duration::from_secs(self.template_poll_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vardiff::ControlStrategy;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_message_size, 10_000);
        assert_eq!(cfg.invalid_share_limit, 8);
        assert_eq!(cfg.vardiff.target_share_secs, 120.0);
        assert_eq!(cfg.vardiff.window_size, 15);
        assert_eq!(cfg.sweep.interval_secs, 10);
        assert_eq!(cfg.sweep.share_expiration_secs, 90.0);
        assert!(matches!(cfg.vardiff.strategy, ControlStrategy::Pid(_)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = Config::from_json(
            r#"{
                "listen": "127.0.0.1:4444",
                "invalid_share_limit": 0,
                "vardiff": {
                    "target_share_secs": 30,
                    "window_size": 10,
                    "strategy": { "kind": "burst", "burst_cap": 4.0 }
                },
                "sweep": { "cooldown_secs": 40 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.listen, "127.0.0.1:4444");
        assert_eq!(cfg.metrics_listen, "0.0.0.0:9100");
        assert_eq!(cfg.invalid_share_limit, 8);
        assert_eq!(cfg.vardiff.target_share_secs, 30.0);
        match cfg.vardiff.strategy {
            ControlStrategy::Burst(p) => {
                assert_eq!(p.burst_cap, 4.0);
                assert_eq!(p.burst_window, 3);
            }
            other => panic!("expected burst strategy, got {:?}", other),
        }
        assert_eq!(cfg.sweep.cooldown_secs, 40.0);
        assert_eq!(cfg.sweep.share_expiration_secs, 90.0);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(Config::from_json("{ nope").is_err());
    }
}
