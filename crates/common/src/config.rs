//! Training arguments and model configuration for rewardtune.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working (if slow) expert-iteration run.

use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::delimiters::{HUMAN_DELIMITER, PROMPT_DELIMITER};

/// Hyper-parameters of the generate → score → filter → fine-tune loop.
///
/// Backwards-compatible: missing fields fall back to their
/// `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    // ── Generation ──────────────────────────────────────────────────────────
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Top-k cut applied before nucleus sampling (0 = disabled).
    #[serde(default)]
    pub top_k: usize,
    /// Number of completions generated per prompt before filtering.
    #[serde(default = "default_superbatch_size")]
    pub superbatch_size: usize,
    /// Number of distinct prompts per superbatch (0 = all prompts at once).
    /// Blends between iterative and single-pass training.
    #[serde(default = "default_one")]
    pub prompt_accumulation_steps: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Truncation bound for reward-model and fine-tuning tokenisation.
    #[serde(default = "default_max_length_rm")]
    pub max_length_rm: usize,
    /// Prepended verbatim to every prompt before generation.
    #[serde(default)]
    pub conversation_prompt: String,
    /// Block repeated n-grams of this size while sampling (0 = off).
    #[serde(default)]
    pub no_repeat_ngram_size: usize,
    /// Repetition penalty applied while sampling (1.0 = off).
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,

    // ── Adaptive minibatch starting points ─────────────────────────────────
    #[serde(default = "default_minibatch_size")]
    pub minibatch_size_generating: usize,
    #[serde(default = "default_minibatch_size")]
    pub minibatch_size_scoring: usize,
    #[serde(default = "default_minibatch_size")]
    pub minibatch_size_finetuning: usize,

    // ── Fine-tuning ─────────────────────────────────────────────────────────
    /// Adds `penalty / loss` to every valid minibatch loss (0 = off).
    #[serde(default)]
    pub inverse_loss_penalty: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// One of `linear`, `cosine`, `constant`, `constant_with_warmup`.
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    #[serde(default)]
    pub scheduler_warmup_steps: usize,
    /// Negative disables the KL computation, 0 computes and reports it
    /// without penalising, positive penalises.
    #[serde(default)]
    pub kl_coefficient: f64,
    /// Score with the validation reward model every N superbatches
    /// (0 = only on the final superbatch).
    #[serde(default)]
    pub validation_interval: usize,
    /// Number of swallowed superbatch failures before the run is aborted.
    #[serde(default)]
    pub max_exception_count: usize,

    // ── Filtering ───────────────────────────────────────────────────────────
    #[serde(default = "default_one")]
    pub completion_filter_top_k: usize,

    // ── Dataset / turn boundaries ──────────────────────────────────────────
    #[serde(default = "default_prompt_delimiter")]
    pub prompt_delimiter: String,
    #[serde(default = "default_human_delimiter")]
    pub human_delimiter: String,

    // ── Reward shaping ──────────────────────────────────────────────────────
    /// Subtracts `length_penalty * ln(char_length)` from train scores.
    #[serde(default)]
    pub length_penalty: f64,

    // ── Reward model flavour ────────────────────────────────────────────────
    /// The train reward model is a two-choice preference model read at a
    /// single next-token position.
    #[serde(default)]
    pub reward_model_is_steamshp: bool,
    /// Vocabulary index standing for "response A is better".
    #[serde(default = "default_preference_choice_token_id")]
    pub preference_choice_token_id: u32,

    // ── Publishing ──────────────────────────────────────────────────────────
    #[serde(default)]
    pub hub_repo_id: Option<String>,
    /// Publish every N completed superbatches (0 = never).
    #[serde(default)]
    pub push_to_hub_interval: usize,
    #[serde(default)]
    pub push_to_hub_additional_indices: Vec<usize>,
    /// When set, the named hyper-parameter is appended to the repo name.
    #[serde(default)]
    pub sweep_param_name: String,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_temperature() -> f64 {
    1.0
}
fn default_top_p() -> f64 {
    0.95
}
fn default_superbatch_size() -> usize {
    32
}
fn default_one() -> usize {
    1
}
fn default_max_new_tokens() -> usize {
    256
}
fn default_max_length_rm() -> usize {
    1024
}
fn default_repetition_penalty() -> f64 {
    1.0
}
fn default_minibatch_size() -> usize {
    64
}
fn default_learning_rate() -> f64 {
    1e-5
}
fn default_scheduler_name() -> String {
    "linear".to_string()
}
fn default_prompt_delimiter() -> String {
    PROMPT_DELIMITER.to_string()
}
fn default_human_delimiter() -> String {
    HUMAN_DELIMITER.to_string()
}
fn default_preference_choice_token_id() -> u32 {
    71
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            seed: 0,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: 0,
            superbatch_size: default_superbatch_size(),
            prompt_accumulation_steps: default_one(),
            max_new_tokens: default_max_new_tokens(),
            max_length_rm: default_max_length_rm(),
            conversation_prompt: String::new(),
            no_repeat_ngram_size: 0,
            repetition_penalty: default_repetition_penalty(),
            minibatch_size_generating: default_minibatch_size(),
            minibatch_size_scoring: default_minibatch_size(),
            minibatch_size_finetuning: default_minibatch_size(),
            inverse_loss_penalty: 0.0,
            learning_rate: default_learning_rate(),
            scheduler_name: default_scheduler_name(),
            scheduler_warmup_steps: 0,
            kl_coefficient: 0.0,
            validation_interval: 0,
            max_exception_count: 0,
            completion_filter_top_k: default_one(),
            prompt_delimiter: default_prompt_delimiter(),
            human_delimiter: default_human_delimiter(),
            length_penalty: 0.0,
            reward_model_is_steamshp: false,
            preference_choice_token_id: default_preference_choice_token_id(),
            hub_repo_id: None,
            push_to_hub_interval: 0,
            push_to_hub_additional_indices: Vec::new(),
            sweep_param_name: String::new(),
        }
    }
}

impl TrainingArguments {
    /// Save arguments to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("write training arguments to {}", path.display()))?;
        Ok(())
    }

    /// Load arguments from a JSON file and validate them.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read training arguments from {}", path.display()))?;
        let args: Self = serde_json::from_str(&json)
            .with_context(|| format!("parse training arguments from {}", path.display()))?;
        args.validate()?;
        Ok(args)
    }

    /// Reject values the trainer cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.superbatch_size == 0 {
            bail!("superbatch_size must be at least 1");
        }
        if self.minibatch_size_generating == 0
            || self.minibatch_size_scoring == 0
            || self.minibatch_size_finetuning == 0
        {
            bail!("minibatch sizes must be at least 1");
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            bail!("top_p must be in (0, 1], got {}", self.top_p);
        }
        if self.temperature < 0.0 {
            bail!("temperature must be non-negative, got {}", self.temperature);
        }
        if self.completion_filter_top_k == 0 {
            bail!("completion_filter_top_k must be at least 1");
        }
        if self.prompt_delimiter.is_empty() {
            bail!("prompt_delimiter must not be empty");
        }
        if self.max_length_rm == 0 {
            bail!("max_length_rm must be at least 1");
        }
        Ok(())
    }

    /// Whether the run is configured to publish at all.
    pub fn publishing_enabled(&self) -> bool {
        self.push_to_hub_interval > 0
            && self.hub_repo_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Value of the swept hyper-parameter named by `sweep_param_name`.
    pub fn sweep_param_value(&self) -> Option<String> {
        let value = match self.sweep_param_name.as_str() {
            "" => return None,
            "accum" => self.prompt_accumulation_steps.to_string(),
            "kl" => self.kl_coefficient.to_string(),
            "invloss" => self.inverse_loss_penalty.to_string(),
            "lr" => self.learning_rate.to_string(),
            "sbs" => self.superbatch_size.to_string(),
            "seed" => self.seed.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Configuration for the built-in tiny causal LM and pooled reward model.
///
/// Stored as `config.json` alongside `model.safetensors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (must match tokeniser).
    pub vocab_size: usize,
    /// Embedding width.
    pub hidden_size: usize,
    /// LoRA rank on the output head (0 = no adapter, full fine-tuning).
    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,
}

fn default_lora_rank() -> usize {
    8
}
fn default_lora_alpha() -> f64 {
    16.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 257, // byte-level tokeniser + EOS
            hidden_size: 64,
            lora_rank: 8,
            lora_alpha: 16.0,
        }
    }
}

impl ModelConfig {
    /// LoRA output scale (`alpha / rank`), 0 when there is no adapter.
    pub fn lora_scale(&self) -> f64 {
        if self.lora_rank == 0 {
            0.0
        } else {
            self.lora_alpha / self.lora_rank as f64
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read model config from {}", path.display()))?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Prompt preparation knobs (applied once before training starts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Drop prompts with at least this many characters (0 = keep all).
    #[serde(default)]
    pub max_prompt_char_length: usize,
    /// Keep only the first N prompts after shuffling (0 = all).
    #[serde(default)]
    pub num_prompts: usize,
    #[serde(default)]
    pub shuffle_seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_prompt_char_length: 0,
            num_prompts: 0,
            shuffle_seed: 0,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
