//! Streaming configuration
//!
//! Every knob the streaming driver recognizes lives here. Missing fields in a
//! JSON file fall back to their defaults.

use std::path::Path;
use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Configuration for the chunk streaming and GPU meshing pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Load radius in chunks around the streaming center.
    pub view_distance: u32,
    /// Maximum new chunks created (and scheduled for generation) per tick.
    pub max_loads_per_tick: usize,
    /// Greedy stage dispatches allowed per tick across all workers.
    pub max_greedy_dispatches_per_tick: usize,
    /// Maximum simultaneous vertex/index readbacks.
    pub max_concurrent_mesh_readbacks: usize,
    /// Maximum chunks that may begin staging on a worker per tick.
    pub max_begin_per_tick: usize,
    /// Number of GPU mesh workers in the pool.
    pub worker_count: usize,
    /// Wall-clock timeout for a pending readback (milliseconds).
    pub readback_timeout_ms: u64,
    /// Retries per readback phase before the chunk degrades to an empty mesh.
    pub max_gpu_retries: u32,
    /// World seed handed to terrain generation.
    pub seed: u32,
    /// Background generation threads (0 = available parallelism).
    pub generation_threads: usize,
    /// Direction toward the sun, used by the shadow march.
    pub sun_direction: [f32; 3],
    /// Shadow march steps (0 disables the march).
    pub shadow_steps: u32,
    /// Shadow march step length in voxels.
    pub shadow_step_length: f32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            view_distance: 8,
            max_loads_per_tick: 10,
            max_greedy_dispatches_per_tick: 6,
            max_concurrent_mesh_readbacks: 2,
            max_begin_per_tick: 1,
            worker_count: 2,
            readback_timeout_ms: 2000,
            max_gpu_retries: 3,
            seed: 1337,
            generation_threads: 0,
            sun_direction: [0.0, 1.0, 0.0],
            shadow_steps: 0,
            shadow_step_length: 0.75,
        }
    }
}

impl StreamingConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the pipeline outright.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 6] = [
            ("worker_count", self.worker_count == 0),
            ("max_greedy_dispatches_per_tick", self.max_greedy_dispatches_per_tick == 0),
            ("max_begin_per_tick", self.max_begin_per_tick == 0),
            ("max_loads_per_tick", self.max_loads_per_tick == 0),
            ("max_concurrent_mesh_readbacks", self.max_concurrent_mesh_readbacks == 0),
            ("readback_timeout_ms", self.readback_timeout_ms == 0),
        ];
        for (name, is_zero) in checks {
            if is_zero {
                return Err(Error::Config(format!("{} must be at least 1", name)));
            }
        }
        if !self.shadow_step_length.is_finite() || self.shadow_step_length < 0.0 {
            return Err(Error::Config(format!(
                "shadow_step_length must be a non-negative number, got {}",
                self.shadow_step_length
            )));
        }
        Ok(())
    }

    /// Readback timeout as a `Duration`.
    pub fn readback_timeout(&self) -> Duration {
        Duration::from_millis(self.readback_timeout_ms)
    }

    /// Normalized sun direction; falls back to straight up for a zero vector.
    pub fn sun_direction(&self) -> Vec3 {
        Vec3::from_array(self.sun_direction).try_normalize().unwrap_or(Vec3::Y)
    }

    /// Resolved generation thread count.
    pub fn generation_threads(&self) -> usize {
        if self.generation_threads > 0 {
            return self.generation_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.readback_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = StreamingConfig {
            worker_count: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("worker_count")));
    }

    #[test]
    fn test_zero_dispatch_budget_rejected() {
        let config = StreamingConfig {
            max_greedy_dispatches_per_tick: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_step_length_rejected() {
        let config = StreamingConfig {
            shadow_step_length: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "view_distance": 3, "worker_count": 4 }}"#).unwrap();

        let config = StreamingConfig::load(file.path()).unwrap();
        assert_eq!(config.view_distance, 3);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_gpu_retries, 3);
        assert_eq!(config.seed, 1337);
    }

    #[test]
    fn test_invalid_json_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_begin_per_tick": 0 }}"#).unwrap();
        assert!(StreamingConfig::load(file.path()).is_err());

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(StreamingConfig::load(garbage.path()), Err(Error::Json(_))));
    }

    #[test]
    fn test_sun_direction_normalized() {
        let config = StreamingConfig {
            sun_direction: [0.0, 2.0, 0.0],
            ..Default::default()
        };
        assert_eq!(config.sun_direction(), Vec3::Y);

        let zero = StreamingConfig {
            sun_direction: [0.0, 0.0, 0.0],
            ..Default::default()
        };
        assert_eq!(zero.sun_direction(), Vec3::Y);
    }
}
