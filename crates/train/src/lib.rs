//! # rewardtune-train: The Expert-Iteration Engine
//!
//! Generate → score → filter → fine-tune, once per superbatch:
//!
//! * **[`ExpertIterationTrainer`]**: the superbatch state machine with
//!   adaptive minibatch sizes and an exception budget.
//! * **[`BestOfNTrainer`]**: one-shot best-of-n over the whole prompt set.
//! * **[`find_executable_batch_size`]**: halve-and-retry on resource exhaustion.
//! * **[`CompletionFilter`]**: top-k / threshold selection per prompt group.
//! * **[`MetricsReporter`]**: console, JSONL and delay sinks.
//! * **[`ModelHub`]**: publish cadence and branch management.
//! * **[`LrScheduler`]**: warmup → cosine / linear / constant.

pub mod adaptive;
pub mod best_of_n;
pub mod filter;
pub mod finetune;
pub mod hub;
pub mod metrics;
pub mod scheduler;
pub mod scoring;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use adaptive::find_executable_batch_size;
pub use best_of_n::{BestOfNConfig, BestOfNSummary, BestOfNTrainer, ScoredCompletion};
pub use filter::{filter_superbatch, CompletionFilter, ScoredGroup, ThresholdFilter, TopKFilter};
pub use finetune::{
    build_labels, check_kl_reference, finetune_language_model, FinetuneOutcome, OptimizerState,
};
pub use hub::{publish, should_push, HubError, LocalHub, ModelHub, PublishOutcome};
pub use metrics::{
    ConsoleReporter, DelayReporter, JsonlReporter, MetricsReporter, MetricsSummary,
    SuperbatchMetrics,
};
pub use scheduler::{LrDecay, LrScheduler};
pub use scoring::{score_completions_train, score_completions_val, should_validate};
pub use trainer::{
    ExpertIterationTrainer, MinibatchSizes, Phase, RewardScorer, RunState, RunSummary,
};
