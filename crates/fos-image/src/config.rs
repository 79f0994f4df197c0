//! Image Pipeline Configuration

use std::time::Duration;

use serde::Deserialize;

/// Tunables for decoding, discarding and downscaling
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Global switch for discarding decoded frames
    pub discarding_enabled: bool,

    /// Time an unlocked, decoded image may sit idle before its frames are discarded (ms)
    pub discard_timeout: u64,

    /// Bytes handed to a decoder per chunk
    pub decode_bytes_per_tick: usize,

    /// Wall-clock budget of one scheduler tick across all images (ms)
    pub max_ms_per_tick: u64,

    /// Enable background high-quality downscaling
    pub hq_downscaling_enabled: bool,

    /// Downscale only when a scale factor is below this value (per-mille)
    pub hq_downscaling_min_factor: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            discarding_enabled: true,
            discard_timeout: 15_000,
            decode_bytes_per_tick: 200_000,
            max_ms_per_tick: 400,
            hq_downscaling_enabled: false,
            hq_downscaling_min_factor: 1000,
        }
    }
}

impl ImageConfig {
    /// Discard TTL
    pub fn discard_timeout(&self) -> Duration {
        Duration::from_millis(self.discard_timeout)
    }

    /// Scheduler tick budget
    pub fn max_tick_duration(&self) -> Duration {
        Duration::from_millis(self.max_ms_per_tick)
    }

    /// Downscale threshold as a scale factor
    pub fn downscale_threshold(&self) -> f32 {
        self.hq_downscaling_min_factor as f32 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImageConfig::default();
        assert!(config.discarding_enabled);
        assert_eq!(config.decode_bytes_per_tick, 200_000);
        assert_eq!(config.max_tick_duration(), Duration::from_millis(400));
        assert_eq!(config.downscale_threshold(), 1.0);
    }

    #[test]
    fn test_partial_deserialize() {
        let config: ImageConfig =
            serde_json::from_str(r#"{ "hq_downscaling_enabled": true, "hq_downscaling_min_factor": 500 }"#)
                .unwrap();
        assert!(config.hq_downscaling_enabled);
        assert_eq!(config.downscale_threshold(), 0.5);
        assert_eq!(config.max_ms_per_tick, 400);
    }
}
