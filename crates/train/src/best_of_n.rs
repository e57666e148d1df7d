//! Single-pass best-of-n: generate n completions for every prompt, keep the
//! best one per prompt, optionally fine-tune once on the survivors.
//!
//! Every stage writes its output as JSON under `output_dir/run_name`, so a
//! run can be inspected or resumed stage by stage.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use rewardtune_common::{truncate_to_first_exchange, TextTokenizer, TrainingArguments};
use rewardtune_core::{PolicyModel, TrainResult};
use rewardtune_infer::{generate_completions, Generator};

use crate::adaptive::find_executable_batch_size;
use crate::filter::{CompletionFilter, ScoredGroup, TopKFilter};
use crate::finetune::{finetune_language_model, FinetuneOutcome, OptimizerState};
use crate::scheduler::LrScheduler;
use crate::scoring::score_completions_val;
use crate::trainer::RewardScorer;

pub const COMPLETIONS_FILE: &str = "completions.json";
pub const SCORED_COMPLETIONS_FILE: &str = "scored_completions.json";
pub const FILTERED_COMPLETIONS_FILE: &str = "filtered_completions.json";

#[derive(Debug, Clone)]
pub struct BestOfNConfig {
    pub completions_per_prompt: usize,
    /// A prompt with any completion longer than this many chars is dropped.
    pub max_completion_chars: usize,
    pub output_dir: PathBuf,
    pub run_name: String,
}

impl Default for BestOfNConfig {
    fn default() -> Self {
        Self {
            completions_per_prompt: 4,
            max_completion_chars: 1000,
            output_dir: PathBuf::from("output"),
            run_name: "UNDEFINED".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCompletion {
    pub score: f32,
    pub completion: String,
}

#[derive(Debug, Clone, Default)]
pub struct BestOfNSummary {
    pub completions: usize,
    pub dropped_prompts: usize,
    pub filtered: Vec<ScoredCompletion>,
    pub finetune: Option<FinetuneOutcome>,
}

pub struct BestOfNTrainer {
    policy: Box<dyn PolicyModel>,
    tokenizer: TextTokenizer,
    reward: RewardScorer,
    generator: Generator,
    args: TrainingArguments,
    config: BestOfNConfig,
    output_folder: PathBuf,
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

/// Indices (mod `num_prompts`) of prompts with an over-long completion.
fn overlong_prompts(completions: &[String], num_prompts: usize, max_chars: usize) -> Vec<usize> {
    let mut bad: Vec<usize> = completions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.chars().count() > max_chars)
        .map(|(i, _)| i % num_prompts)
        .collect();
    bad.sort_unstable();
    bad.dedup();
    bad
}

/// Best completion per prompt. Completions are strided: prompt `j` owns
/// every index `i` with `i % num_prompts == j`.
pub fn best_per_prompt(
    scored: &[ScoredCompletion],
    completions_per_prompt: usize,
) -> TrainResult<Vec<ScoredCompletion>> {
    let num_prompts = scored.len() / completions_per_prompt.max(1);
    let mut groups = vec![ScoredGroup::default(); num_prompts];
    for (i, s) in scored.iter().enumerate().take(num_prompts * completions_per_prompt) {
        let group = &mut groups[i % num_prompts];
        group.scores.push(s.score);
        group.lengths.push(s.completion.chars().count());
        group.completions.push(s.completion.clone());
    }
    let best = TopKFilter { k: 1 };
    let mut out = Vec::with_capacity(num_prompts);
    for group in &groups {
        let kept = best.filter(group)?;
        out.extend(
            kept.scores
                .into_iter()
                .zip(kept.completions)
                .map(|(score, completion)| ScoredCompletion { score, completion }),
        );
    }
    Ok(out)
}

impl BestOfNTrainer {
    pub fn new(
        policy: Box<dyn PolicyModel>,
        mut tokenizer: TextTokenizer,
        reward: RewardScorer,
        args: TrainingArguments,
        config: BestOfNConfig,
    ) -> anyhow::Result<Self> {
        tokenizer.ensure_pad_token();
        let output_folder = config.output_dir.join(&config.run_name);
        std::fs::create_dir_all(&output_folder)
            .with_context(|| format!("create {}", output_folder.display()))?;
        Ok(Self {
            policy,
            tokenizer,
            reward,
            generator: Generator::from_args(&args),
            args,
            config,
            output_folder,
        })
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    pub fn policy(&self) -> &dyn PolicyModel {
        self.policy.as_ref()
    }

    /// Generate `completions_per_prompt` completions for every prompt. The
    /// prompt list is repeated as a whole, so output `i` belongs to prompt
    /// `i % prompts.len()`. Each completion keeps only its first exchange.
    pub fn generate_completions(&mut self, prompts: &[String]) -> TrainResult<Vec<String>> {
        let repeated: Vec<String> = prompts
            .iter()
            .cycle()
            .take(prompts.len() * self.config.completions_per_prompt)
            .map(|p| format!("{}{p}", self.args.conversation_prompt))
            .collect();
        info!("Generating {} completions", repeated.len());
        let policy = self.policy.as_ref();
        let tokenizer = &self.tokenizer;
        let generator = &mut self.generator;
        let (raw, _) = find_executable_batch_size(
            self.args.minibatch_size_generating,
            "generation",
            |bs| generate_completions(policy, tokenizer, generator, &repeated, bs),
        )?;
        let completions: Vec<String> = raw.iter().map(|c| truncate_to_first_exchange(c)).collect();
        write_json(&self.output_folder.join(COMPLETIONS_FILE), &completions)?;
        Ok(completions)
    }

    /// Score completions, first dropping every prompt that has an over-long
    /// completion. Returns the scored list and the number of dropped prompts.
    pub fn score_completions(
        &self,
        completions: &[String],
        num_prompts: usize,
    ) -> TrainResult<(Vec<ScoredCompletion>, usize)> {
        let bad = overlong_prompts(
            completions,
            num_prompts.max(1),
            self.config.max_completion_chars,
        );
        let kept: Vec<String> = completions
            .iter()
            .enumerate()
            .filter(|(i, _)| bad.binary_search(&(i % num_prompts.max(1))).is_err())
            .map(|(_, c)| c.clone())
            .collect();
        info!(
            "Loaded {} completions (filtered {} from {} total)",
            kept.len(),
            completions.len() - kept.len(),
            completions.len()
        );

        let reward = &self.reward;
        let max_length = self.args.max_length_rm;
        let (scores, _) =
            find_executable_batch_size(self.args.minibatch_size_scoring, "scoring", |bs| {
                score_completions_val(
                    reward.model.as_ref(),
                    &reward.tokenizer,
                    &kept,
                    max_length,
                    bs,
                )
            })?;
        let scored: Vec<ScoredCompletion> = scores
            .into_iter()
            .zip(kept)
            .map(|(score, completion)| ScoredCompletion { score, completion })
            .collect();
        write_json(&self.output_folder.join(SCORED_COMPLETIONS_FILE), &scored)?;
        Ok((scored, bad.len()))
    }

    pub fn filter_completions(
        &self,
        scored: &[ScoredCompletion],
    ) -> TrainResult<Vec<ScoredCompletion>> {
        let filtered = best_per_prompt(scored, self.config.completions_per_prompt)?;
        write_json(&self.output_folder.join(FILTERED_COMPLETIONS_FILE), &filtered)?;
        Ok(filtered)
    }

    /// One fine-tuning pass over the filtered completions.
    pub fn tune_model(&mut self, filtered: &[ScoredCompletion]) -> TrainResult<FinetuneOutcome> {
        info!("Fine-tuning on {} filtered completions", filtered.len());
        for c in filtered.iter().take(2) {
            info!("Score: {}, Completion: {}", c.score, c.completion);
        }
        let texts: Vec<String> = filtered.iter().map(|c| c.completion.clone()).collect();
        let scheduler = LrScheduler::from_name(
            &self.args.scheduler_name,
            self.args.learning_rate,
            self.args.scheduler_warmup_steps,
            1,
        )?;
        let mut optimizer = OptimizerState::new(self.policy.trainable_vars(), scheduler)?;
        let policy = self.policy.as_ref();
        let tokenizer = &self.tokenizer;
        let args = &self.args;
        let (outcome, _) = find_executable_batch_size(
            self.args.minibatch_size_finetuning,
            "fine-tuning",
            |bs| finetune_language_model(policy, tokenizer, &mut optimizer, &texts, args, bs),
        )?;
        Ok(outcome)
    }

    pub fn run(&mut self, prompts: &[String], finetune: bool) -> TrainResult<BestOfNSummary> {
        let completions = self.generate_completions(prompts)?;
        let (scored, dropped_prompts) = self.score_completions(&completions, prompts.len())?;
        let filtered = self.filter_completions(&scored)?;
        let finetune = if finetune {
            Some(self.tune_model(&filtered)?)
        } else {
            None
        };
        Ok(BestOfNSummary {
            completions: completions.len(),
            dropped_prompts,
            filtered,
            finetune,
        })
    }
}
