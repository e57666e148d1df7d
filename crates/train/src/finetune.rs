//! Fine-tuning stage: supervised loss on filtered completions.
//!
//! Only the model's own completion tokens are trained on: the prompt prefix
//! (everything up to and including the last prompt delimiter) and padding are
//! labelled [`IGNORE_INDEX`]. Optional extras per minibatch:
//!
//! * inverse-loss penalty `p / loss`, which keeps the loss from collapsing;
//! * KL against the reference policy (the same model with its adapter off),
//!   clamped at zero and added as `kl_coefficient * kl` when the coefficient
//!   is positive. A negative coefficient skips the reference pass entirely.
//!
//! One AdamW step per valid minibatch, one scheduler step per stage run.

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, warn};

use rewardtune_common::{
    separate_prompt_from_completion, EncodedBatch, PaddingSide, TextTokenizer, TrainingArguments,
};
use rewardtune_core::loss::shifted_log_probs;
use rewardtune_core::{
    clamp_kl, masked_lm_loss, reference_log_probs, token_kl_divergence, PolicyModel,
    ShiftedTargets, TrainError, TrainResult, IGNORE_INDEX,
};

use crate::scheduler::LrScheduler;

// ── Labels ──────────────────────────────────────────────────────────────────

/// Right-padded token batch with next-token labels.
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    pub batch: EncodedBatch,
    pub labels: Vec<Vec<i64>>,
}

/// Tokenise `texts` (truncated to `max_length`) and build labels with the
/// prompt prefix and padding masked out.
pub fn build_labels(
    tokenizer: &TextTokenizer,
    texts: &[String],
    prompt_delimiter: &str,
    max_length: usize,
) -> TrainResult<LabeledBatch> {
    let batch = tokenizer.encode_batch_with_side(texts, Some(max_length), PaddingSide::Right)?;
    let mut labels = Vec::with_capacity(texts.len());
    for ((text, ids), mask) in texts.iter().zip(&batch.input_ids).zip(&batch.attention_mask) {
        let (prompt, _) = separate_prompt_from_completion(text, prompt_delimiter);
        let prompt_tokens = tokenizer.encode(prompt)?.len();
        let row = ids
            .iter()
            .zip(mask)
            .enumerate()
            .map(|(pos, (&id, &m))| {
                if pos < prompt_tokens || m == 0 {
                    IGNORE_INDEX
                } else {
                    i64::from(id)
                }
            })
            .collect();
        labels.push(row);
    }
    Ok(LabeledBatch { batch, labels })
}

// ── Optimiser state ─────────────────────────────────────────────────────────

/// AdamW over the policy's trainable variables plus the LR schedule.
pub struct OptimizerState {
    optimizer: AdamW,
    scheduler: LrScheduler,
    steps: usize,
}

impl OptimizerState {
    pub fn new(vars: Vec<Var>, scheduler: LrScheduler) -> TrainResult<Self> {
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: scheduler.current_lr(),
                ..Default::default()
            },
        )?;
        Ok(Self {
            optimizer,
            scheduler,
            steps: 0,
        })
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.current_lr()
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    /// Optimiser steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn step(&mut self, loss: &Tensor) -> TrainResult<()> {
        self.optimizer.set_learning_rate(self.scheduler.current_lr());
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.steps += 1;
        Ok(())
    }
}

// ── Stage ───────────────────────────────────────────────────────────────────

/// Loss and KL averaged over valid minibatches (0 when there were none).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FinetuneOutcome {
    pub average_loss: f32,
    pub average_kl: f32,
    pub valid_minibatches: usize,
    pub invalid_minibatches: usize,
}

/// The KL term needs a reference policy, which is the model with its
/// adapter switched off. Without an adapter it would compare the model with
/// itself.
pub fn check_kl_reference<M: PolicyModel + ?Sized>(
    model: &M,
    args: &TrainingArguments,
) -> TrainResult<()> {
    if args.kl_coefficient >= 0.0 && !model.has_adapter() {
        return Err(TrainError::InvalidConfig(format!(
            "kl_coefficient {} requires a policy with a LoRA adapter; set it negative to disable KL",
            args.kl_coefficient
        )));
    }
    Ok(())
}

/// Run one fine-tuning pass over `completions` in minibatches of `minibatch_size`.
///
/// Optimiser steps taken before a failure are kept; a retry at a smaller
/// size starts again from the first minibatch.
pub fn finetune_language_model<M: PolicyModel + ?Sized>(
    model: &M,
    tokenizer: &TextTokenizer,
    state: &mut OptimizerState,
    completions: &[String],
    args: &TrainingArguments,
    minibatch_size: usize,
) -> TrainResult<FinetuneOutcome> {
    check_kl_reference(model, args)?;
    debug!("Trying fine-tuning with batch size {minibatch_size}");
    let mut sum_loss = 0.0f32;
    let mut sum_kl = 0.0f32;
    let mut valid = 0usize;
    let mut invalid = 0usize;

    for chunk in completions.chunks(minibatch_size.max(1)) {
        let labeled = build_labels(tokenizer, chunk, &args.prompt_delimiter, args.max_length_rm)?;
        if labeled.batch.seq_len() < 2 {
            invalid += 1;
            continue;
        }
        let (input_ids, attention_mask) = labeled.batch.to_tensors(model.device())?;
        let targets = ShiftedTargets::from_labels(&labeled.labels, model.device())?;

        let logits = model.forward(&input_ids, &attention_mask)?;
        let log_probs = shifted_log_probs(&logits)?;
        let mut loss = masked_lm_loss(&log_probs, &targets)?;

        let raw_loss = loss.to_scalar::<f32>()?;
        if !raw_loss.is_finite() || raw_loss < 0.0 {
            invalid += 1;
            continue;
        }

        if args.inverse_loss_penalty > 0.0 {
            let penalty = loss.recip()?.affine(args.inverse_loss_penalty, 0.0)?;
            loss = (loss + penalty)?;
        }

        if args.kl_coefficient >= 0.0 {
            let t = logits.dim(1)?;
            let reference =
                reference_log_probs(model, &input_ids, &attention_mask)?.narrow(1, 0, t - 1)?;
            let kl = clamp_kl(&token_kl_divergence(&log_probs, &reference, &targets.mask)?)?;
            let kl_total = kl.sum_all()?;
            sum_kl += kl_total.to_scalar::<f32>()?;
            if args.kl_coefficient > 0.0 {
                loss = (loss + kl_total.affine(args.kl_coefficient, 0.0)?)?;
            }
        }

        sum_loss += loss.to_scalar::<f32>()?;
        state.step(&loss)?;
        valid += 1;
    }
    state.scheduler.advance();

    if invalid > 0 {
        warn!("{invalid} minibatches had nan, inf, or negative loss");
    }
    let average = |sum: f32| if valid > 0 { sum / valid as f32 } else { 0.0 };
    Ok(FinetuneOutcome {
        average_loss: average(sum_loss),
        average_kl: average(sum_kl),
        valid_minibatches: valid,
        invalid_minibatches: invalid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rewardtune_common::ModelConfig;
    use rewardtune_core::TinyCausalLm;

    fn tokenizer() -> TextTokenizer {
        let mut t = TextTokenizer::byte_level();
        t.ensure_pad_token();
        t
    }

    fn tiny() -> TinyCausalLm {
        TinyCausalLm::new(
            &ModelConfig {
                vocab_size: 257,
                hidden_size: 16,
                lora_rank: 4,
                lora_alpha: 8.0,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn masking_counts_only_completion_tokens() {
        let tok = tokenizer();
        let texts = vec![
            "\n\nHuman: hi\n\nAssistant: hello".to_string(),
            "\n\nHuman: a\n\nAssistant: b\n\nHuman: c\n\nAssistant: a longer reply".to_string(),
            "no delimiter at all".to_string(),
        ];
        let labeled = build_labels(&tok, &texts, "\n\nAssistant:", 1024).unwrap();
        for (text, labels) in texts.iter().zip(&labeled.labels) {
            let (_, completion) = separate_prompt_from_completion(text, "\n\nAssistant:");
            let kept = labels.iter().filter(|&&l| l != IGNORE_INDEX).count();
            assert_eq!(kept, tok.encode(completion).unwrap().len(), "{text:?}");
        }
    }

    #[test]
    fn truncation_applies_before_masking() {
        let tok = tokenizer();
        let texts = vec!["P\n\nAssistant: abcdefgh".to_string()];
        let labeled = build_labels(&tok, &texts, "\n\nAssistant:", 15).unwrap();
        assert_eq!(labeled.batch.seq_len(), 15);
        let kept = labeled.labels[0].iter().filter(|&&l| l != IGNORE_INDEX).count();
        assert_eq!(kept, 15 - "P\n\nAssistant:".len());
    }

    #[test]
    fn stage_steps_scheduler_once_and_updates_adapter() {
        let model = tiny();
        let tok = tokenizer();
        let scheduler = LrScheduler::from_name("constant", 1e-2, 0, 4).unwrap();
        let mut state = OptimizerState::new(model.trainable_vars(), scheduler).unwrap();
        let args = TrainingArguments {
            kl_coefficient: 0.1,
            inverse_loss_penalty: 0.01,
            ..Default::default()
        };
        let texts: Vec<String> = (0..3)
            .map(|i| format!("\n\nHuman: q{i}\n\nAssistant: answer {i}"))
            .collect();
        let outcome = finetune_language_model(&model, &tok, &mut state, &texts, &args, 2).unwrap();
        assert_eq!(outcome.valid_minibatches, 2);
        assert_eq!(outcome.invalid_minibatches, 0);
        assert_eq!(state.steps(), 2);
        assert_eq!(state.scheduler().step(), 1);
        assert!(outcome.average_loss > 0.0);
        assert!(outcome.average_kl >= 0.0);
        assert!(model.adapter_enabled());
    }

    #[test]
    fn kl_without_adapter_is_rejected() {
        let model = TinyCausalLm::new(
            &ModelConfig {
                vocab_size: 257,
                hidden_size: 16,
                lora_rank: 0,
                lora_alpha: 8.0,
            },
            &Device::Cpu,
        )
        .unwrap();
        let tok = tokenizer();
        let scheduler = LrScheduler::from_name("constant", 1e-3, 0, 1).unwrap();
        let mut state = OptimizerState::new(model.trainable_vars(), scheduler).unwrap();
        let texts = vec!["\n\nHuman: q\n\nAssistant: a".to_string()];

        let args = TrainingArguments::default();
        let err = finetune_language_model(&model, &tok, &mut state, &texts, &args, 1).unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
        assert_eq!(state.steps(), 0);

        let args = TrainingArguments {
            kl_coefficient: -1.0,
            ..Default::default()
        };
        let outcome = finetune_language_model(&model, &tok, &mut state, &texts, &args, 1).unwrap();
        assert_eq!(outcome.valid_minibatches, 1);
    }

    #[test]
    fn all_prompt_minibatch_is_invalid_and_scheduler_still_steps() {
        let model = tiny();
        let tok = tokenizer();
        let scheduler = LrScheduler::from_name("linear", 1e-3, 0, 4).unwrap();
        let mut state = OptimizerState::new(model.trainable_vars(), scheduler).unwrap();
        let args = TrainingArguments::default();
        // Nothing after the delimiter: every label is ignored, so the loss is NaN.
        let texts = vec!["\n\nHuman: q\n\nAssistant:".to_string()];
        let outcome = finetune_language_model(&model, &tok, &mut state, &texts, &args, 4).unwrap();
        assert_eq!(outcome.valid_minibatches, 0);
        assert_eq!(outcome.invalid_minibatches, 1);
        assert_eq!(outcome.average_loss, 0.0);
        assert_eq!(state.steps(), 0);
        assert_eq!(state.scheduler().step(), 1);
    }
}
