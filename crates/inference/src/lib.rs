//! # rewardtune-infer: Sampling and Generation
//!
//! * **[`Sampler`]**: temperature, top-k, top-p over one row of logits.
//! * **[`LogitsProcessorChain`]**: ordered n-gram blocking and repetition penalty.
//! * **[`generate_completions`]**: the generation stage: left-padded batched sampling.

pub mod generate;
pub mod processors;
pub mod sampler;

pub use generate::{expand_prompts, generate_completions, Generator};
pub use processors::{LogitsProcessor, LogitsProcessorChain, NoRepeatNGram, RepetitionPenalty};
pub use sampler::{Sampler, SamplerConfig};
