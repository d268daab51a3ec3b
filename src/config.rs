//! Generation configuration for nano-genai.
//!
//! [`GenerationConfig`] is a plain parameter bag. It is validated as a whole
//! before any inference starts and the decoding mode is derived from it on
//! demand, never stored:
//!
//! ```text
//! do_sample  num_beams   mode
//! ─────────  ─────────   ───────────
//!   false        1       Greedy
//!   false       >1       BeamSearch
//!   true         1       Multinomial
//!   true        >1       rejected (ConflictingMode)
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_genai::{DecodingMode, GenerationConfig};
//!
//! let config = GenerationConfig {
//!     max_new_tokens: Some(20),
//!     num_beams: 4,
//!     num_return_sequences: 2,
//!     ..Default::default()
//! };
//! config.validate().unwrap();
//! assert_eq!(config.resolve_mode(), DecodingMode::BeamSearch);
//! assert_eq!(config.get_max_new_tokens(7).unwrap(), 20);
//! ```

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::model::TokenId;

/// Result type for configuration checks.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// When a beam group stops searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopCriteria {
    /// Stop as soon as the group holds enough finished beams.
    Early,
    /// Stop once no unfinished beam can beat the worst finished one.
    #[default]
    Heuristic,
    /// Only stop when every beam finished or the budget ran out.
    Never,
}

/// Decoding algorithm derived from a [`GenerationConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodingMode {
    Greedy,
    BeamSearch,
    Multinomial,
}

impl DecodingMode {
    /// Get the mode name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::BeamSearch => "beam_search",
            Self::Multinomial => "multinomial",
        }
    }
}

/// Unified configuration for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate. Takes priority over `max_length`.
    pub max_new_tokens: Option<usize>,
    /// Maximum total length (prompt + generated).
    pub max_length: Option<usize>,
    /// Keep generating after the EOS token.
    pub ignore_eos: bool,
    /// End-of-sequence token ID.
    pub eos_token_id: Option<TokenId>,
    /// Number of diverse beam groups.
    pub num_beam_groups: usize,
    /// Total number of beams across all groups.
    pub num_beams: usize,
    /// Penalty subtracted per earlier-group selection of the same token.
    pub diversity_penalty: f32,
    /// Exponent applied to the sequence length when ranking beams.
    pub length_penalty: f32,
    /// Number of sequences returned.
    pub num_return_sequences: usize,
    /// Forbid repeating n-grams of this size (`None` or 0 = disabled).
    pub no_repeat_ngram_size: Option<usize>,
    /// Beam search stopping rule.
    pub stop_criteria: StopCriteria,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling probability mass.
    pub top_p: f32,
    /// Number of highest logits kept before sampling.
    pub top_k: usize,
    /// Use multinomial sampling.
    pub do_sample: bool,
    /// Repetition penalty (1.0 = disabled).
    pub repetition_penalty: f32,
    /// Seed for the sampling RNG (`None` = from entropy).
    pub rng_seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            max_length: None,
            ignore_eos: false,
            eos_token_id: None,
            num_beam_groups: 1,
            num_beams: 1,
            diversity_penalty: 1.0,
            length_penalty: 1.0,
            num_return_sequences: 1,
            no_repeat_ngram_size: None,
            stop_criteria: StopCriteria::Heuristic,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            do_sample: false,
            repetition_penalty: 1.0,
            rng_seed: None,
        }
    }
}

impl GenerationConfig {
    /// Preset for greedy decoding.
    pub fn greedy() -> Self {
        Self {
            max_new_tokens: Some(30),
            ..Default::default()
        }
    }

    /// Preset for grouped diverse beam search.
    pub fn beam_search() -> Self {
        Self {
            max_new_tokens: Some(100),
            num_beams: 4,
            num_beam_groups: 2,
            num_return_sequences: 3,
            diversity_penalty: 2.0,
            ..Default::default()
        }
    }

    /// Preset for multinomial sampling.
    pub fn multinomial() -> Self {
        Self {
            max_new_tokens: Some(30),
            do_sample: true,
            temperature: 0.8,
            top_p: 0.8,
            top_k: 20,
            num_return_sequences: 5,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file.
    ///
    /// See [`GenerationConfig::from_json_str`] for the accepted format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse a configuration document.
    ///
    /// Keys match the field names. Unknown keys are ignored, missing keys
    /// keep their defaults and `null` unsets optional fields. The Hugging Face
    /// `early_stopping` key is mapped onto [`StopCriteria`].
    ///
    /// # Errors
    ///
    /// Malformed JSON yields [`Error::Json`](crate::Error::Json); a value of
    /// the wrong type yields [`ConfigError::InvalidRange`].
    ///
    /// The result is not validated: budgets are often supplied per call.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let data: Value = serde_json::from_str(text)?;
        Ok(Self::from_json_value(&data)?)
    }

    /// Read a configuration from an already-parsed JSON value.
    pub fn from_json_value(data: &Value) -> ConfigResult<Self> {
        if !data.is_object() {
            return Err(ConfigError::InvalidRange(
                "generation config must be a JSON object".to_string(),
            ));
        }

        let mut config = Self::default();
        read_param(data, "max_new_tokens", &mut config.max_new_tokens)?;
        read_param(data, "max_length", &mut config.max_length)?;
        read_param(data, "ignore_eos", &mut config.ignore_eos)?;
        read_param(data, "num_beam_groups", &mut config.num_beam_groups)?;
        read_param(data, "num_beams", &mut config.num_beams)?;
        read_param(data, "diversity_penalty", &mut config.diversity_penalty)?;
        read_param(data, "length_penalty", &mut config.length_penalty)?;
        read_param(data, "num_return_sequences", &mut config.num_return_sequences)?;
        read_param(data, "no_repeat_ngram_size", &mut config.no_repeat_ngram_size)?;
        read_param(data, "stop_criteria", &mut config.stop_criteria)?;
        read_param(data, "temperature", &mut config.temperature)?;
        read_param(data, "top_p", &mut config.top_p)?;
        read_param(data, "top_k", &mut config.top_k)?;
        read_param(data, "do_sample", &mut config.do_sample)?;
        read_param(data, "repetition_penalty", &mut config.repetition_penalty)?;
        read_param(data, "rng_seed", &mut config.rng_seed)?;

        match data.get("eos_token_id") {
            // Hugging Face configs may list several EOS ids; the first one wins.
            Some(Value::Array(ids)) => {
                config.eos_token_id = match ids.first() {
                    Some(first) => parse_value("eos_token_id", first)?,
                    None => None,
                };
            }
            Some(value) => config.eos_token_id = parse_value("eos_token_id", value)?,
            None => {}
        }

        if let Some(value) = data.get("early_stopping") {
            config.stop_criteria = match value {
                Value::Bool(true) => StopCriteria::Early,
                Value::Bool(false) => StopCriteria::Heuristic,
                Value::String(s) if s == "never" => StopCriteria::Never,
                other => {
                    return Err(ConfigError::InvalidRange(format!(
                        "'early_stopping' must be a bool or \"never\", got {other}"
                    )))
                }
            };
        }

        Ok(config)
    }

    /// Apply per-call overrides, producing a new validated configuration.
    ///
    /// `self` is left untouched; the merged result is validated as a whole so
    /// that interacting fields are re-checked together.
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> ConfigResult<Self> {
        let mut config = self.clone();
        overrides.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant of the configuration.
    ///
    /// A token budget (`max_new_tokens` or `max_length`) is always required,
    /// which also guarantees that `ignore_eos` and EOS-less configurations
    /// terminate.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.num_beams == 0 {
            return Err(ConfigError::InvalidRange(
                "'num_beams' must be greater than 0".to_string(),
            ));
        }
        if self.num_beam_groups == 0 {
            return Err(ConfigError::InvalidRange(
                "'num_beam_groups' must be greater than 0".to_string(),
            ));
        }
        if self.do_sample && self.num_beams != 1 {
            return Err(ConfigError::ConflictingMode(
                "beam search with sampling is not supported; set do_sample=false to use \
                 beam search or num_beams=1 to use multinomial sampling"
                    .to_string(),
            ));
        }
        if self.num_beams % self.num_beam_groups != 0 {
            return Err(ConfigError::ConflictingMode(format!(
                "'num_beams' ({}) must be divisible by 'num_beam_groups' ({})",
                self.num_beams, self.num_beam_groups
            )));
        }

        match (self.max_new_tokens, self.max_length) {
            (Some(0), _) => {
                return Err(ConfigError::InvalidRange(
                    "'max_new_tokens' must be greater than 0".to_string(),
                ))
            }
            (Some(_), _) => {}
            (None, Some(0)) => {
                return Err(ConfigError::InvalidRange(
                    "'max_length' must be greater than 0".to_string(),
                ))
            }
            (None, Some(_)) => {}
            (None, None) => {
                let reason = if self.ignore_eos {
                    "ignore_eos is set, so 'max_new_tokens' or 'max_length' must be defined"
                } else {
                    "either 'max_new_tokens' or 'max_length' must be defined"
                };
                return Err(ConfigError::MissingBudget(reason.to_string()));
            }
        }

        if !is_positive(self.repetition_penalty) {
            return Err(ConfigError::InvalidRange(format!(
                "'repetition_penalty' must be a strictly positive float, got {}",
                self.repetition_penalty
            )));
        }
        if self.num_return_sequences == 0 {
            return Err(ConfigError::InvalidRange(
                "'num_return_sequences' must be greater than 0".to_string(),
            ));
        }

        match self.resolve_mode() {
            DecodingMode::Greedy => {
                if self.num_return_sequences != 1 {
                    return Err(ConfigError::ConflictingMode(format!(
                        "greedy decoding returns a single sequence, got num_return_sequences={}",
                        self.num_return_sequences
                    )));
                }
            }
            DecodingMode::Multinomial => {
                if self.top_k == 0 {
                    return Err(ConfigError::InvalidRange(
                        "'top_k' must be strictly positive".to_string(),
                    ));
                }
                if !(is_positive(self.top_p) && self.top_p <= 1.0) {
                    return Err(ConfigError::InvalidRange(format!(
                        "'top_p' must be in (0, 1], got {}",
                        self.top_p
                    )));
                }
                if !is_positive(self.temperature) {
                    return Err(ConfigError::InvalidRange(format!(
                        "'temperature' must be a strictly positive float, got {}",
                        self.temperature
                    )));
                }
            }
            DecodingMode::BeamSearch => {
                if !is_positive(self.length_penalty) {
                    return Err(ConfigError::InvalidRange(format!(
                        "'length_penalty' must be a strictly positive float, got {}",
                        self.length_penalty
                    )));
                }
                if self.num_beam_groups > 1 && !is_positive(self.diversity_penalty) {
                    return Err(ConfigError::InvalidRange(format!(
                        "'diversity_penalty' must be a strictly positive float, got {}",
                        self.diversity_penalty
                    )));
                }
                if self.num_return_sequences > self.num_beams {
                    return Err(ConfigError::InvalidRange(format!(
                        "'num_return_sequences' ({}) cannot exceed 'num_beams' ({})",
                        self.num_return_sequences, self.num_beams
                    )));
                }
            }
        }

        Ok(())
    }

    /// Derive the decoding mode.
    pub fn resolve_mode(&self) -> DecodingMode {
        if self.is_beam_search() {
            DecodingMode::BeamSearch
        } else if self.is_multinomial() {
            DecodingMode::Multinomial
        } else {
            DecodingMode::Greedy
        }
    }

    /// Greedy decoding: no sampling and a single beam.
    pub fn is_greedy_decoding(&self) -> bool {
        !self.do_sample && !self.is_beam_search()
    }

    /// Beam search: more than one beam.
    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    /// Multinomial sampling.
    pub fn is_multinomial(&self) -> bool {
        self.do_sample
    }

    /// Number of beams in each beam group.
    pub fn group_size(&self) -> usize {
        self.num_beams / self.num_beam_groups.max(1)
    }

    /// Effective n-gram size for repetition blocking (0 = disabled).
    pub fn ngram_block_size(&self) -> usize {
        self.no_repeat_ngram_size.unwrap_or(0)
    }

    /// Whether `token` ends a sequence under this configuration.
    pub fn is_stop_token(&self, token: TokenId) -> bool {
        !self.ignore_eos && self.eos_token_id == Some(token)
    }

    /// Token budget for a prompt of `prompt_length` tokens.
    ///
    /// `max_new_tokens` wins whenever it is set; otherwise the budget is
    /// whatever `max_length` leaves after the prompt.
    pub fn get_max_new_tokens(&self, prompt_length: usize) -> ConfigResult<usize> {
        match (self.max_new_tokens, self.max_length) {
            (Some(max_new_tokens), _) => Ok(max_new_tokens),
            (None, Some(max_length)) if max_length > prompt_length => {
                Ok(max_length - prompt_length)
            }
            (None, Some(max_length)) => Err(ConfigError::BudgetUnderflow {
                max_length,
                prompt_length,
            }),
            (None, None) => Err(ConfigError::MissingBudget(
                "either 'max_new_tokens' or 'max_length' must be defined".to_string(),
            )),
        }
    }
}

/// Per-call overrides for a [`GenerationConfig`].
///
/// Each `Some` field replaces the corresponding base value. Overrides are
/// only ever applied through [`GenerationConfig::with_overrides`], which
/// re-validates the merged result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub max_new_tokens: Option<usize>,
    pub max_length: Option<usize>,
    pub ignore_eos: Option<bool>,
    pub eos_token_id: Option<TokenId>,
    pub num_beam_groups: Option<usize>,
    pub num_beams: Option<usize>,
    pub diversity_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub num_return_sequences: Option<usize>,
    pub no_repeat_ngram_size: Option<usize>,
    pub stop_criteria: Option<StopCriteria>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub do_sample: Option<bool>,
    pub repetition_penalty: Option<f32>,
    pub rng_seed: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of new tokens.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    /// Set the number of beams.
    pub fn num_beams(mut self, num_beams: usize) -> Self {
        self.num_beams = Some(num_beams);
        self
    }

    /// Set the number of beam groups.
    pub fn num_beam_groups(mut self, num_beam_groups: usize) -> Self {
        self.num_beam_groups = Some(num_beam_groups);
        self
    }

    /// Enable or disable sampling.
    pub fn do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = Some(do_sample);
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the sampling seed.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    fn apply_to(&self, config: &mut GenerationConfig) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn set_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set_opt(&mut config.max_new_tokens, &self.max_new_tokens);
        set_opt(&mut config.max_length, &self.max_length);
        set(&mut config.ignore_eos, &self.ignore_eos);
        set_opt(&mut config.eos_token_id, &self.eos_token_id);
        set(&mut config.num_beam_groups, &self.num_beam_groups);
        set(&mut config.num_beams, &self.num_beams);
        set(&mut config.diversity_penalty, &self.diversity_penalty);
        set(&mut config.length_penalty, &self.length_penalty);
        set(&mut config.num_return_sequences, &self.num_return_sequences);
        set_opt(&mut config.no_repeat_ngram_size, &self.no_repeat_ngram_size);
        set(&mut config.stop_criteria, &self.stop_criteria);
        set(&mut config.temperature, &self.temperature);
        set(&mut config.top_p, &self.top_p);
        set(&mut config.top_k, &self.top_k);
        set(&mut config.do_sample, &self.do_sample);
        set(&mut config.repetition_penalty, &self.repetition_penalty);
        set_opt(&mut config.rng_seed, &self.rng_seed);
    }
}

/// Strictly positive and not NaN.
fn is_positive(value: f32) -> bool {
    value > 0.0 && value.is_finite()
}

fn read_param<T: DeserializeOwned>(data: &Value, key: &str, target: &mut T) -> ConfigResult<()> {
    if let Some(value) = data.get(key) {
        *target = parse_value(key, value)?;
    }
    Ok(())
}

fn parse_value<T: DeserializeOwned>(key: &str, value: &Value) -> ConfigResult<T> {
    T::deserialize(value)
        .map_err(|e| ConfigError::InvalidRange(format!("'{key}' has an invalid value {value}: {e}")))
}
