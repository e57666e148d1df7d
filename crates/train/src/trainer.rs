//! Expert-iteration trainer: the superbatch loop.
//!
//! Each superbatch walks `Generating → Scoring → Filtering → FineTuning →
//! Reporting → Publishing` and returns to `Idle`. The loop ends in `Done`
//! after the last superbatch or in `Failed` once the exception budget is
//! exceeded.
//!
//! Failure policy per superbatch:
//!
//! * `MalformedScoringOutput` skips the superbatch and is not counted;
//! * anything else increments the exception count. Over budget it is
//!   returned unchanged; under budget the superbatch is abandoned, and for
//!   resource-class errors the adaptive minibatch sizes go back to their
//!   configured values.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use rewardtune_common::{TextTokenizer, TrainingArguments};
use rewardtune_core::{PolicyModel, RewardModel, TrainError, TrainResult};
use rewardtune_infer::{expand_prompts, generate_completions, Generator};

use crate::adaptive::find_executable_batch_size;
use crate::filter::{filter_superbatch, CompletionFilter, TopKFilter};
use crate::finetune::{check_kl_reference, finetune_language_model, OptimizerState};
use crate::hub::{publish, ModelHub};
use crate::metrics::{MetricsReporter, SuperbatchMetrics};
use crate::scheduler::LrScheduler;
use crate::scoring::{score_completions_train, score_completions_val, should_validate};

// ── Run state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Generating,
    Scoring,
    Filtering,
    FineTuning,
    Reporting,
    Publishing,
    Done,
    Failed,
}

/// Current minibatch size of each heavy stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinibatchSizes {
    pub generating: usize,
    pub scoring: usize,
    pub finetuning: usize,
}

impl MinibatchSizes {
    pub fn from_args(args: &TrainingArguments) -> Self {
        Self {
            generating: args.minibatch_size_generating,
            scoring: args.minibatch_size_scoring,
            finetuning: args.minibatch_size_finetuning,
        }
    }
}

/// Mutable loop state, carried across superbatches.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: Phase,
    pub exception_count: usize,
    /// Sizes that last worked; a successful halving persists here.
    pub sizes: MinibatchSizes,
    pub initial_sizes: MinibatchSizes,
}

impl RunState {
    pub fn new(args: &TrainingArguments) -> Self {
        let sizes = MinibatchSizes::from_args(args);
        Self {
            phase: Phase::Idle,
            exception_count: 0,
            sizes,
            initial_sizes: sizes,
        }
    }

    fn reset_sizes(&mut self) {
        self.sizes = self.initial_sizes;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub superbatch_count: usize,
    pub completed: usize,
    /// Skipped because a reward model returned malformed output.
    pub skipped_malformed: usize,
    /// Abandoned after an error counted against the budget.
    pub abandoned: usize,
    pub exception_count: usize,
    pub optimizer_steps: usize,
    pub final_lr: f64,
}

/// A reward model with the tokenizer its inputs are encoded with.
pub struct RewardScorer {
    pub model: Box<dyn RewardModel>,
    pub tokenizer: TextTokenizer,
}

impl RewardScorer {
    pub fn new(model: Box<dyn RewardModel>, mut tokenizer: TextTokenizer) -> Self {
        tokenizer.ensure_pad_token();
        Self { model, tokenizer }
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct ExpertIterationTrainer {
    policy: Box<dyn PolicyModel>,
    tokenizer: TextTokenizer,
    reward_train: RewardScorer,
    reward_val: Option<RewardScorer>,
    filter: Box<dyn CompletionFilter>,
    reporters: Vec<Box<dyn MetricsReporter>>,
    hub: Option<Box<dyn ModelHub>>,
    generator: Generator,
    args: TrainingArguments,
    state: RunState,
}

impl ExpertIterationTrainer {
    pub fn new(
        policy: Box<dyn PolicyModel>,
        mut tokenizer: TextTokenizer,
        reward_train: RewardScorer,
        args: TrainingArguments,
    ) -> Self {
        tokenizer.ensure_pad_token();
        Self {
            policy,
            tokenizer,
            reward_train,
            reward_val: None,
            filter: Box::new(TopKFilter {
                k: args.completion_filter_top_k,
            }),
            reporters: Vec::new(),
            hub: None,
            generator: Generator::from_args(&args),
            state: RunState::new(&args),
            args,
        }
    }

    pub fn with_validation(mut self, reward_val: RewardScorer) -> Self {
        self.reward_val = Some(reward_val);
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn CompletionFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Reporters are called in registration order.
    pub fn with_reporter(mut self, reporter: Box<dyn MetricsReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn with_hub(mut self, hub: Box<dyn ModelHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn policy(&self) -> &dyn PolicyModel {
        self.policy.as_ref()
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Run the loop over `prompts`, taken in order in chunks of
    /// `prompt_accumulation_steps` (0 = all prompts in one superbatch).
    pub fn train(&mut self, prompts: &[String]) -> TrainResult<RunSummary> {
        self.args
            .validate()
            .map_err(|e| TrainError::InvalidConfig(format!("{e:#}")))?;
        check_kl_reference(self.policy.as_ref(), &self.args)?;

        let prompts_per_superbatch = match self.args.prompt_accumulation_steps {
            0 => prompts.len().max(1),
            n => n,
        };
        let superbatches: Vec<&[String]> = prompts.chunks(prompts_per_superbatch).collect();
        let total = superbatches.len();

        let scheduler = LrScheduler::from_name(
            &self.args.scheduler_name,
            self.args.learning_rate,
            self.args.scheduler_warmup_steps,
            total,
        )
        .map_err(|e| TrainError::InvalidConfig(format!("{e:#}")))?;
        let mut optimizer = OptimizerState::new(self.policy.trainable_vars(), scheduler)?;

        info!(
            prompts = prompts.len(),
            superbatches = total,
            completions_per_prompt = self.args.superbatch_size,
            "Starting expert iteration"
        );

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} superbatches")
        {
            pb.set_style(style.progress_chars("=>-"));
        }

        let mut summary = RunSummary {
            superbatch_count: total,
            ..Default::default()
        };
        for (index, superbatch_prompts) in superbatches.iter().enumerate() {
            debug!("Before generation, on superbatch {index}");
            match self.run_superbatch(
                index,
                total,
                superbatch_prompts,
                prompts_per_superbatch,
                &mut optimizer,
                &pb,
            ) {
                Ok(()) => summary.completed += 1,
                Err(err) if err.is_malformed_output() => {
                    warn!("Error during scoring completions, skipping superbatch {index}: {err}");
                    summary.skipped_malformed += 1;
                }
                Err(err) => {
                    self.state.exception_count += 1;
                    warn!(
                        "Error during superbatch {index}: {err}. Total exception count: {}/{}",
                        self.state.exception_count, self.args.max_exception_count
                    );
                    if self.state.exception_count > self.args.max_exception_count {
                        self.state.phase = Phase::Failed;
                        pb.abandon();
                        return Err(err);
                    }
                    if err.is_resource_class() {
                        self.state.reset_sizes();
                    }
                    summary.abandoned += 1;
                }
            }
            self.state.phase = Phase::Idle;
            pb.inc(1);
        }
        pb.finish_with_message("done");

        self.state.phase = Phase::Done;
        summary.exception_count = self.state.exception_count;
        summary.optimizer_steps = optimizer.steps();
        summary.final_lr = optimizer.current_lr();
        info!(
            completed = summary.completed,
            skipped = summary.skipped_malformed,
            abandoned = summary.abandoned,
            "Expert iteration finished"
        );
        Ok(summary)
    }

    fn run_superbatch(
        &mut self,
        index: usize,
        total: usize,
        prompts: &[String],
        prompts_per_superbatch: usize,
        optimizer: &mut OptimizerState,
        pb: &ProgressBar,
    ) -> TrainResult<()> {
        // Generate
        self.state.phase = Phase::Generating;
        let expanded = expand_prompts(
            prompts,
            &self.args.conversation_prompt,
            self.args.superbatch_size,
        );
        let policy = self.policy.as_ref();
        let tokenizer = &self.tokenizer;
        let generator = &mut self.generator;
        let (raw, size) =
            find_executable_batch_size(self.state.sizes.generating, "generation", |bs| {
                generate_completions(policy, tokenizer, generator, &expanded, bs)
            })?;
        self.state.sizes.generating = size;

        // Score
        self.state.phase = Phase::Scoring;
        let reward = &self.reward_train;
        let args = &self.args;
        let (scored, size) = find_executable_batch_size(self.state.sizes.scoring, "scoring", |bs| {
            score_completions_train(
                reward.model.as_ref(),
                &reward.tokenizer,
                &raw,
                &expanded,
                args,
                bs,
            )
        })?;
        self.state.sizes.scoring = size;

        let scores_val = match &self.reward_val {
            Some(val) if should_validate(index, total, self.args.validation_interval) => {
                score_completions_val(
                    val.model.as_ref(),
                    &val.tokenizer,
                    &scored.completions,
                    self.args.max_length_rm,
                    self.state.sizes.scoring,
                )?
            }
            _ => Vec::new(),
        };

        // Filter
        self.state.phase = Phase::Filtering;
        let filtered = filter_superbatch(self.filter.as_ref(), self.args.superbatch_size, &scored)?;
        pb.println(format!("Superbatch {index} - Filtered Completions:"));
        for completion in &filtered.completions {
            pb.println(completion.replace('\n', "\\n"));
        }

        // Fine-tune
        self.state.phase = Phase::FineTuning;
        let (outcome, size) =
            find_executable_batch_size(self.state.sizes.finetuning, "fine-tuning", |bs| {
                finetune_language_model(
                    policy,
                    tokenizer,
                    optimizer,
                    &filtered.completions,
                    args,
                    bs,
                )
            })?;
        self.state.sizes.finetuning = size;

        // Report
        self.state.phase = Phase::Reporting;
        let metrics = SuperbatchMetrics {
            superbatch_index: index,
            superbatch_count: total,
            completions: scored.completions,
            filtered_completions: filtered.completions,
            scores_train: scored.scores,
            scores_val,
            filtered_scores: filtered.scores,
            average_loss: outcome.average_loss,
            average_kl_div: outcome.average_kl,
            scheduler_lr: optimizer.current_lr(),
            completion_lengths: scored.lengths,
            filtered_completion_lengths: filtered.lengths,
        };
        for reporter in &self.reporters {
            if let Err(err) = reporter.report(&metrics) {
                warn!(reporter = reporter.name(), "Metrics reporter failed: {err:#}");
            }
        }

        // Publish
        if let Some(hub) = &self.hub {
            self.state.phase = Phase::Publishing;
            publish(
                hub.as_ref(),
                &self.args,
                policy,
                tokenizer,
                index + 1,
                total,
                prompts_per_superbatch,
            )?;
        }
        Ok(())
    }
}
