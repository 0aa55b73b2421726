use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::job::model::phases;

/// Root configuration for the processing core.
///
/// Loaded by embedding binaries via [`PipelineConfig::load`], which layers a
/// base file, an optional environment-specific override, and `REEL_`-prefixed
/// environment variables on top — the same layering used elsewhere in the
/// host stack's own config loader. The core never installs this itself; it
/// only defines the shape and the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pools: HashMap<String, PoolConfig>,
    pub retry: HashMap<String, RetryConfig>,
    pub quality: QualityConfig,
    pub paths: PathConfig,
    pub job_history_retention: String,
    pub trash_retention_days: u32,
    pub lockout: LockoutConfig,
    pub token_ttl_seconds: i64,
    pub feeder_batch_size: i64,
    pub feeder_poll_interval_ms: u64,
    pub retry_sweep_interval_seconds: u64,
    pub dlq_abandon_after_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut pools = HashMap::new();
        for phase in [
            phases::METADATA,
            phases::THUMBNAIL,
            phases::SPRITES,
            phases::FINGERPRINT,
            phases::ANIMATED_THUMBNAILS,
            phases::MARKER_THUMBNAILS,
        ] {
            pools.insert(phase.to_string(), PoolConfig::default());
        }

        Self {
            pools,
            retry: HashMap::new(),
            quality: QualityConfig::default(),
            paths: PathConfig::default(),
            job_history_retention: "7d".to_string(),
            trash_retention_days: 7,
            lockout: LockoutConfig::default(),
            token_ttl_seconds: 24 * 3600,
            feeder_batch_size: 20,
            feeder_poll_interval_ms: 1000,
            retry_sweep_interval_seconds: 30,
            dlq_abandon_after_days: 7,
        }
    }
}

impl PipelineConfig {
    /// Layers `base_path` (if present), `<base_path>.<profile>` (if present
    /// and `profile` is set), and `REEL_`-prefixed environment variables over
    /// the struct defaults.
    pub fn load(base_path: Option<&str>, profile: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&PipelineConfig::default())?);

        if let Some(path) = base_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
            if let Some(profile) = profile {
                builder = builder
                    .add_source(config::File::with_name(&format!("{path}.{profile}")).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("REEL")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoreError::Fatal(format!("config load failed: {e}")))
    }

    pub fn pool_for(&self, phase: &str) -> PoolConfig {
        self.pools.get(phase).cloned().unwrap_or_default()
    }

    pub fn retry_for(&self, phase: &str) -> RetryConfig {
        self.retry.get(phase).cloned().unwrap_or_default()
    }

    /// Parses `job_history_retention` (e.g. `"7d"`, `"12h"`) via `humantime`,
    /// falling back to the 7-day default on a malformed value rather than
    /// failing startup over a non-fatal field.
    pub fn job_history_retention_duration(&self) -> Duration {
        humantime::parse_duration(&self.job_history_retention)
            .unwrap_or(Duration::from_secs(7 * 24 * 3600))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub job_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            job_timeout_seconds: 300,
        }
    }
}

/// Per-phase exponential backoff policy. Defaults match §3 of the spec:
/// `3, 30, 3600, 2.0`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u16,
    pub initial_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_seconds: 30.0,
            max_delay_seconds: 3600.0,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// `delay_k = min(initial * factor^k, maxDelay)`, in seconds.
    pub fn delay_for(&self, retry_count: u16) -> Duration {
        let raw = self.initial_delay_seconds * self.backoff_factor.powi(retry_count as i32);
        Duration::from_secs_f64(raw.min(self.max_delay_seconds).max(0.0))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub thumbnail_small_max_dim: u32,
    pub thumbnail_large_max_dim: u32,
    pub quality_levels: [u8; 3],
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            thumbnail_small_max_dim: 320,
            thumbnail_large_max_dim: 1280,
            quality_levels: [60, 80, 95],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub metadata_path: String,
    pub thumbnails_dir: String,
    pub sprites_dir: String,
    pub vtt_dir: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            metadata_path: "metadata".to_string(),
            thumbnails_dir: "thumbnails".to_string(),
            sprites_dir: "sprites".to_string(),
            vtt_dir: "vtt".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub duration_seconds: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            duration_seconds: 15 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_matches_spec_formula() {
        let cfg = RetryConfig {
            max_retries: 3,
            initial_delay_seconds: 1.0,
            max_delay_seconds: 60.0,
            backoff_factor: 2.0,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(1), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn retry_delay_caps_at_max() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.delay_for(20), Duration::from_secs_f64(3600.0));
    }

    #[test]
    fn default_config_has_a_pool_per_well_known_phase() {
        let cfg = PipelineConfig::default();
        assert!(cfg.pools.contains_key(phases::METADATA));
        assert!(cfg.pools.contains_key(phases::SPRITES));
    }

    #[test]
    fn job_history_retention_parses_duration_suffix() {
        let cfg = PipelineConfig::default();
        assert_eq!(
            cfg.job_history_retention_duration(),
            Duration::from_secs(7 * 24 * 3600)
        );
    }
}
