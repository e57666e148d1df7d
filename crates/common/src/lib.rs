//! # rewardtune-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainingArguments`]** / **[`ModelConfig`]** / **[`DataConfig`]**: run configuration (serialised as JSON).
//! * **[`BoundaryPolicy`]**: named turn-boundary detection for trimming completions.
//! * **[`TextTokenizer`]**: encode/decode with batch padding and truncation.
//! * **[`load_prompts`]** / **[`prepare_prompts`]**: the prompt pool.

pub mod config;
pub mod data;
pub mod delimiters;
pub mod tokenizer;

pub use config::{DataConfig, ModelConfig, TrainingArguments};
pub use data::{load_prompts, prepare_prompts};
pub use delimiters::{
    separate_prompt_from_completion, split_after_prompt, trim_completion,
    truncate_to_first_exchange, BoundaryPolicy, HUMAN_DELIMITER, PROMPT_DELIMITER,
};
pub use tokenizer::{EncodedBatch, PaddingSide, TextTokenizer};
