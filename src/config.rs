//! # Configuration Management
//!
//! Loads the gateway configuration from multiple sources and validates it
//! once at startup. After validation the configuration is immutable for the
//! process lifetime — changing limits, timeouts, or provider chains requires
//! a restart.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SESSION_MAX_CONCURRENT, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration containing all gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionLimitsConfig,
    pub transcription: TranscriptionBackendConfig,
    pub synthesis: SynthesisConfig,
}

/// Server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Default audio window policy and sample format for new sessions.
///
/// A session's `configure` control frame may override any of these per
/// session; values here apply to sessions that stream before reconfiguring
/// individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Expected sample rate in Hz (16000 for most STT providers)
    pub sample_rate: u32,

    /// Number of audio channels (1 = mono)
    pub channels: u8,

    /// Bit depth of PCM samples (16-bit little-endian)
    pub bit_depth: u8,

    /// Minimum accumulated duration before a window may be dispatched
    pub min_window_ms: u32,

    /// Duration at which a window is dispatched regardless of voice activity
    pub max_window_ms: u32,

    /// Hard ceiling; exceeding it without readiness is a buffer overflow
    pub hard_max_ms: u32,
}

/// Session registry limits and idle cleanup cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimitsConfig {
    /// Maximum number of concurrent voice sessions
    pub max_concurrent: usize,

    /// Sessions idle longer than this are terminated by the sweep
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs
    pub sweep_interval_secs: u64,
}

/// Remote speech-to-text backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionBackendConfig {
    /// Transcription endpoint URL
    pub endpoint_url: String,

    /// Bearer token; falls back to the STT_API_KEY environment variable
    pub api_key: Option<String>,

    /// Model identifier passed through to the provider
    pub model: String,

    /// Bounded per-call timeout in milliseconds
    pub timeout_ms: u64,

    /// Fixed backoff before the single transport-failure retry
    pub retry_backoff_ms: u64,
}

/// Speech-synthesis provider chain and resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Providers in priority order; the first healthy one wins
    pub providers: Vec<SynthesisProviderConfig>,

    /// Bounded timeout for acquiring a provider's audio stream
    pub request_timeout_ms: u64,

    /// Consecutive classified failures before a provider's breaker opens
    pub breaker_failure_threshold: u32,

    /// How long an open breaker rejects calls before admitting a trial
    pub breaker_cooldown_ms: u64,
}

/// One entry in the synthesis provider chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisProviderConfig {
    pub name: String,
    pub endpoint_url: String,
    pub api_key: Option<String>,
    /// Default voice identifier when the client does not request one
    pub default_voice: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                min_window_ms: 1000,
                max_window_ms: 5000,
                hard_max_ms: 15000,
            },
            session: SessionLimitsConfig {
                max_concurrent: 32,
                idle_timeout_secs: 120,
                sweep_interval_secs: 30,
            },
            transcription: TranscriptionBackendConfig {
                endpoint_url: "http://127.0.0.1:9100/v1/audio/transcriptions".to_string(),
                api_key: None,
                model: "whisper-large-v3".to_string(),
                timeout_ms: 5000,
                retry_backoff_ms: 250,
            },
            synthesis: SynthesisConfig {
                providers: vec![SynthesisProviderConfig {
                    name: "primary".to_string(),
                    endpoint_url: "http://127.0.0.1:9200/v1/audio/speech".to_string(),
                    api_key: None,
                    default_voice: Some("alloy".to_string()),
                }],
                request_timeout_ms: 8000,
                breaker_failure_threshold: 3,
                breaker_cooldown_ms: 30000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and APP_* environment
    /// variables, in that priority order.
    ///
    /// `HOST` and `PORT` are also honored without the APP_ prefix because
    /// deployment platforms commonly inject them that way.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense together.
    ///
    /// Catching bad values here keeps every later component free to assume a
    /// coherent window policy and non-zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }

        if !matches!(self.audio.bit_depth, 8 | 16) {
            return Err(anyhow::anyhow!(
                "Unsupported bit depth {} (expected 8 or 16)",
                self.audio.bit_depth
            ));
        }

        if self.audio.min_window_ms == 0 {
            return Err(anyhow::anyhow!("Minimum window duration must be greater than 0"));
        }

        if self.audio.min_window_ms > self.audio.max_window_ms {
            return Err(anyhow::anyhow!(
                "min_window_ms ({}) must not exceed max_window_ms ({})",
                self.audio.min_window_ms,
                self.audio.max_window_ms
            ));
        }

        if self.audio.max_window_ms > self.audio.hard_max_ms {
            return Err(anyhow::anyhow!(
                "max_window_ms ({}) must not exceed hard_max_ms ({})",
                self.audio.max_window_ms,
                self.audio.hard_max_ms
            ));
        }

        if self.transcription.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Transcription timeout must be greater than 0"));
        }

        if self.synthesis.providers.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one synthesis provider must be configured"
            ));
        }

        if self.synthesis.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Synthesis request timeout must be greater than 0"));
        }

        if self.synthesis.breaker_failure_threshold == 0 {
            return Err(anyhow::anyhow!(
                "Circuit breaker failure threshold must be greater than 0"
            ));
        }

        Ok(())
    }
}

impl TranscriptionBackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl SynthesisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 16000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_policy_ordering_is_enforced() {
        let mut config = AppConfig::default();
        config.audio.min_window_ms = 6000; // above max_window_ms
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_window_ms = 20000; // above hard_max_ms
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_provider_chain_is_rejected() {
        let mut config = AppConfig::default();
        config.synthesis.providers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let mut config = AppConfig::default();
        config.session.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
