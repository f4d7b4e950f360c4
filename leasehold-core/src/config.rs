use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// Lease length in milliseconds when the caller does not pass one.
    pub default_ttl_ms: u64,
    /// Renewals happen every `ttl / renewal_divisor`.
    pub renewal_divisor: u32,
    /// Pause between acquisition attempts when retrying on contention.
    pub acquire_retry_wait_ms: u64,
    /// Extra acquisition attempts after the first one fails with contention.
    pub acquire_retry_count: u32,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60_000,
            renewal_divisor: 3,
            acquire_retry_wait_ms: 0,
            acquire_retry_count: 0,
            log_format: "compact".to_string(),
        }
    }
}

impl LockConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("LEASEHOLD"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: LockConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn acquire_retry_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_wait_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_ttl_ms == 0 {
            bail!("default_ttl_ms must be greater than zero");
        }
        if self.renewal_divisor < 2 {
            bail!(
                "renewal_divisor must be at least 2 so one missed renewal does not lose the lease (got {})",
                self.renewal_divisor
            );
        }
        Ok(())
    }
}
