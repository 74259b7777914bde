//! Configuration surface of the turn engine.
//!
//! Secrets come from the environment (after `dotenvy::dotenv()`); tuning comes from a TOML file
//! whose every field has a default, so an empty or missing file yields a working engine.

use crate::consts::{APP_GREETING, DEFAULT_CONFIG_PATH, DEFAULT_SYSTEM_INSTRUCTION};
use crate::error::ConfigError;
use crate::functions::ParamType;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent: AgentConfig,
    pub endpointing: EndpointingConfig,
    pub interruption: InterruptionConfig,
    pub sampling: SamplingConfig,
    pub context: ContextConfig,
    pub generation: GenerationConfig,
    pub providers: ProvidersConfig,
    pub functions: Vec<FunctionConfig>,
    pub events: EventsConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_instruction: String,
    pub tenant_id: String,
    pub region: String,
    pub voice_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            tenant_id: "default".to_string(),
            region: "local".to_string(),
            voice_id: "aura-asteria-en".to_string(),
        }
    }
}

/// Which silence threshold applies to this call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    Fast,
    #[default]
    Standard,
    ComplexInput,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointingConfig {
    pub use_case: UseCase,
    pub fast_ms: u64,
    pub standard_ms: u64,
    pub complex_input_ms: u64,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            use_case: UseCase::Standard,
            fast_ms: 500,
            standard_ms: 700,
            complex_input_ms: 1_500,
        }
    }
}

impl EndpointingConfig {
    pub fn silence_threshold_ms(&self) -> u64 {
        match self.use_case {
            UseCase::Fast => self.fast_ms,
            UseCase::Standard => self.standard_ms,
            UseCase::ComplexInput => self.complex_input_ms,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InterruptionConfig {
    /// Words the barge-in utterance must reach before the agent yields.
    pub min_words: usize,
    /// Optional duration alternative to `min_words`.
    pub min_speech_ms: Option<u64>,
    /// Bound on waiting for pipeline cancellation acknowledgements.
    pub cancel_budget_ms: u64,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            min_words: 2,
            min_speech_ms: None,
            cancel_budget_ms: 150,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingProfile {
    Compliance,
    #[default]
    Conversational,
    Creative,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub profile: SamplingProfile,
    pub compliance: SamplingParams,
    pub conversational: SamplingParams,
    pub creative: SamplingParams,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            profile: SamplingProfile::Conversational,
            compliance: SamplingParams {
                temperature: 0.1,
                top_p: 0.9,
                max_output_tokens: 150,
            },
            conversational: SamplingParams {
                temperature: 0.7,
                top_p: 1.0,
                max_output_tokens: 200,
            },
            creative: SamplingParams {
                temperature: 1.0,
                top_p: 1.0,
                max_output_tokens: 300,
            },
        }
    }
}

impl SamplingConfig {
    pub fn params(&self, profile: SamplingProfile) -> SamplingParams {
        match profile {
            SamplingProfile::Compliance => self.compliance,
            SamplingProfile::Conversational => self.conversational,
            SamplingProfile::Creative => self.creative,
        }
    }

    pub fn selected(&self) -> SamplingParams {
        self.params(self.profile)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: usize,
    /// Compress when occupancy exceeds this fraction of the budget.
    pub compress_threshold: f32,
    /// Stop compressing once occupancy is at or below this fraction.
    pub compress_target: f32,
    pub summary_max_words: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 4_096,
            compress_threshold: 0.8,
            compress_target: 0.6,
            summary_max_words: 120,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tool_rounds: usize,
    pub function_timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 3,
            function_timeout_ms: 3_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter: 0.5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeepgramConfig {
    pub listen_url: String,
    pub speak_url: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Size of outbound audio frames.
    pub frame_ms: u64,
    /// Speaking rate used to place word marks when the service reports none.
    pub words_per_minute: u32,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            listen_url: "wss://api.deepgram.com/v1/listen".to_string(),
            speak_url: "https://api.deepgram.com/v1/speak".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8_000,
            frame_ms: 100,
            words_per_minute: 165,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OpenAIConfig {
    pub url: String,
    pub model: String,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Fallback order per capability; the first entry is the primary.
    pub transcriber: Vec<String>,
    pub generator: Vec<String>,
    pub synthesizer: Vec<String>,
    pub request_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub deepgram: DeepgramConfig,
    pub openai: OpenAIConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            transcriber: vec!["deepgram".to_string()],
            generator: vec!["openai".to_string()],
            synthesizer: vec!["deepgram".to_string()],
            request_timeout_ms: 3_000,
            stream_idle_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            deepgram: DeepgramConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<String>>,
}

/// One allow-listed function the model may call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FunctionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Webhook receiving validated calls.
    pub endpoint: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 1_024 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub greeting: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            greeting: APP_GREETING.to_string(),
            log_level: "debug".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or from `TURN_ENGINE_CONFIG`, or from the default path if it exists.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| env::var("TURN_ENGINE_CONFIG").ok());
        let config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            None => {
                warn!("no config file found; using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        debug!(path=%path, "reading engine config");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        };
        let e = &self.endpointing;
        if e.fast_ms == 0 || e.standard_ms == 0 || e.complex_input_ms == 0 {
            return Err(invalid("endpointing", "silence thresholds must be positive"));
        }
        if self.interruption.min_words == 0 && self.interruption.min_speech_ms.is_none() {
            return Err(invalid(
                "interruption.min_words",
                "must be at least 1 unless min_speech_ms is set",
            ));
        }
        let c = &self.context;
        if !(0.0..=1.0).contains(&c.compress_threshold) || c.compress_threshold == 0.0 {
            return Err(invalid("context.compress_threshold", "must be in (0, 1]"));
        }
        if c.compress_target >= c.compress_threshold {
            return Err(invalid(
                "context.compress_target",
                "must be below compress_threshold",
            ));
        }
        if c.budget_tokens == 0 {
            return Err(invalid("context.budget_tokens", "must be positive"));
        }
        let p = &self.providers;
        if p.transcriber.is_empty() || p.generator.is_empty() || p.synthesizer.is_empty() {
            return Err(invalid("providers", "each capability needs at least one provider"));
        }
        if p.retry.max_attempts == 0 {
            return Err(invalid("providers.retry.max_attempts", "must be at least 1"));
        }
        if p.circuit.failure_threshold == 0 {
            return Err(invalid(
                "providers.circuit.failure_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// API keys read from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub deepgram_api_key: String,
    pub openai_api_key: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        let deepgram_api_key =
            env::var("DEEPGRAM_API_KEY").map_err(|_| ConfigError::MissingEnv("DEEPGRAM_API_KEY"))?;
        let openai_api_key =
            env::var("OPENAI_API_KEY").map_err(|_| ConfigError::MissingEnv("OPENAI_API_KEY"))?;
        Ok(Self {
            deepgram_api_key,
            openai_api_key,
        })
    }
}
