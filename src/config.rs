use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "itinerary-sync.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_presence_debounce_ms")]
    pub presence_debounce_ms: u64,
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,
    /// Re-plans allowed when the affected partitions shift while waiting on locks.
    #[serde(default = "default_max_plan_retries")]
    pub max_plan_retries: u32,
}

fn default_persist_timeout_ms() -> u64 {
    10_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_presence_debounce_ms() -> u64 {
    250
}

fn default_feed_buffer() -> usize {
    256
}

fn default_max_plan_retries() -> u32 {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_timeout_ms: default_persist_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            presence_debounce_ms: default_presence_debounce_ms(),
            feed_buffer: default_feed_buffer(),
            max_plan_retries: default_max_plan_retries(),
        }
    }
}

impl EngineConfig {
    pub fn load_or_init(dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let config: EngineConfig =
                serde_json::from_str(&raw).map_err(|err| AppError::Config(err.to_string()))?;
            config.validate()?;
            return Ok(config);
        }

        let config = EngineConfig::default();
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        tracing::info!(path = %path.to_string_lossy(), "wrote default engine config");
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.persist_timeout_ms == 0 || self.fetch_timeout_ms == 0 {
            return Err(AppError::Config("persistence timeouts must be positive".to_string()));
        }
        if self.feed_buffer == 0 {
            return Err(AppError::Config("feedBuffer must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn presence_debounce(&self) -> Duration {
        Duration::from_millis(self.presence_debounce_ms)
    }
}
