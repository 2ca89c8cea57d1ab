//! Typed settings for the turn-taking pipeline.
//!
//! Every threshold the conversation components consult lives here, with the
//! defaults the components were tuned against. Settings are layered:
//! built-in defaults, then an optional TOML file, then `PARLEY__*`
//! environment variables (`PARLEY__FINAL_GATE__COOLDOWN_MS=250`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub utterance: UtteranceSettings,
    pub final_gate: FinalGateSettings,
    pub segmenter: SegmenterSettings,
    pub tts_queue: TtsQueueSettings,
    pub coordinator: CoordinatorSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("PARLEY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tts_queue.max_concurrent == 0 {
            return Err(SettingsError::Invalid(
                "tts_queue.max_concurrent must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("utterance.trigger_threshold", self.utterance.trigger_threshold),
            ("final_gate.trigger_threshold", self.final_gate.trigger_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SettingsError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.utterance.min_length == 0 || self.final_gate.min_length == 0 {
            return Err(SettingsError::Invalid(
                "minimum transcript length must be non-zero".to_string(),
            ));
        }
        if self.utterance.confidence_history < 4 {
            return Err(SettingsError::Invalid(
                "utterance.confidence_history must keep at least 4 samples".to_string(),
            ));
        }
        if self.segmenter.max_chars == 0 {
            return Err(SettingsError::Invalid(
                "segmenter.max_chars must be non-zero".to_string(),
            ));
        }
        if self.coordinator.fallback_phrase.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "coordinator.fallback_phrase must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial-transcript admission thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceSettings {
    /// Minimum trimmed length before any rule is considered.
    pub min_length: usize,
    /// A partial must grow by more than this many characters to count.
    pub growth_delta_chars: usize,
    /// Elapsed time since utterance start for the natural-pause rule.
    pub min_pause_ms: u64,
    /// Boosted confidence needed by the smart-confidence rule.
    pub trigger_threshold: f64,
    pub question_min_length: usize,
    pub pause_min_length: usize,
    pub confidence_min_length: usize,
    pub starter_min_length: usize,
    pub starter_min_elapsed_ms: u64,
    pub question_boost: f64,
    pub trend_boost: f64,
    pub stability_boost: f64,
    /// Variance below which the last four confidences count as stable.
    pub stability_max_variance: f64,
    /// Rolling confidence samples kept per utterance.
    pub confidence_history: usize,
    /// Inactivity after which an utterance is swept.
    pub expiry_secs: u64,
}

impl Default for UtteranceSettings {
    fn default() -> Self {
        Self {
            min_length: 10,
            growth_delta_chars: 3,
            min_pause_ms: 500,
            trigger_threshold: 0.5,
            question_min_length: 12,
            pause_min_length: 15,
            confidence_min_length: 18,
            starter_min_length: 12,
            starter_min_elapsed_ms: 300,
            question_boost: 0.15,
            trend_boost: 0.1,
            stability_boost: 0.1,
            stability_max_variance: 0.01,
            confidence_history: 5,
            expiry_secs: 30,
        }
    }
}

impl UtteranceSettings {
    pub fn min_pause(&self) -> Duration {
        Duration::from_millis(self.min_pause_ms)
    }

    pub fn starter_min_elapsed(&self) -> Duration {
        Duration::from_millis(self.starter_min_elapsed_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Final-transcript admission thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalGateSettings {
    pub cooldown_ms: u64,
    pub min_length: usize,
    /// Short transcripts tolerated in a row before spam protection kicks in.
    pub max_consecutive_short: u32,
    pub trigger_threshold: f64,
    pub question_min_length: usize,
    pub confidence_min_length: usize,
    pub natural_phrase_min_length: usize,
    pub substantial_length: usize,
    pub inactivity_secs: u64,
}

impl Default for FinalGateSettings {
    fn default() -> Self {
        Self {
            cooldown_ms: 400,
            min_length: 10,
            max_consecutive_short: 3,
            trigger_threshold: 0.5,
            question_min_length: 10,
            confidence_min_length: 15,
            natural_phrase_min_length: 12,
            substantial_length: 25,
            inactivity_secs: 300,
        }
    }
}

impl FinalGateSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }
}

/// Token-to-phrase segmentation thresholds. Counts are whole words.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    pub first_phrase_min_words: usize,
    pub min_words: usize,
    pub semantic_min_words: usize,
    pub gap_ms: u64,
    pub gap_min_words: usize,
    pub max_chars: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            first_phrase_min_words: 2,
            min_words: 4,
            semantic_min_words: 3,
            gap_ms: 60,
            gap_min_words: 2,
            max_chars: 100,
        }
    }
}

impl SegmenterSettings {
    pub fn gap(&self) -> Duration {
        Duration::from_millis(self.gap_ms)
    }
}

/// Speech synthesis admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsQueueSettings {
    /// Syntheses allowed in flight across all sessions.
    pub max_concurrent: usize,
    /// Pause before a continuation phrase competes for synthesis.
    pub inter_phrase_gap_ms: u64,
    pub streaming_synthesis: bool,
    pub default_language: String,
    pub default_voice: Option<String>,
}

impl Default for TtsQueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            inter_phrase_gap_ms: 50,
            streaming_synthesis: true,
            default_language: "en".to_string(),
            default_voice: None,
        }
    }
}

impl TtsQueueSettings {
    pub fn inter_phrase_gap(&self) -> Duration {
        Duration::from_millis(self.inter_phrase_gap_ms)
    }
}

/// What happens when a final transcript arrives while a partial-started
/// response for the same utterance is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Cancel the partial response and answer the final transcript instead.
    #[default]
    CancelAndResupersede,
    /// Keep the partial response and ignore the final transcript.
    BlockFinal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub dedup_policy: DedupPolicy,
    /// Stream final-path responses phrase by phrase instead of speaking the
    /// whole reply at once.
    pub stream_final_responses: bool,
    /// Turns of history handed to the language model.
    pub history_limit: usize,
    pub fallback_phrase: String,
    pub sweep_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            dedup_policy: DedupPolicy::default(),
            stream_final_responses: true,
            history_limit: 10,
            fallback_phrase:
                "I'm sorry, I'm having a technical issue right now. Could you say that again?"
                    .to_string(),
            sweep_interval_secs: 10,
            shutdown_timeout_secs: 5,
        }
    }
}

impl CoordinatorSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
