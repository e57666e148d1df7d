//! Batched sampling from a [`PolicyModel`].
//!
//! Prompts are left-padded so every row's last prompt token sits in the same
//! column; each step appends one sampled token per unfinished row. Rows stop
//! at EOS and are padded (mask 0) from then on.

use candle_core::IndexOp;
use tracing::debug;

use rewardtune_common::{PaddingSide, TextTokenizer, TrainingArguments};
use rewardtune_core::{PolicyModel, TrainResult};

use crate::processors::LogitsProcessorChain;
use crate::sampler::{Sampler, SamplerConfig};

/// Sampler + processor chain + token budget. Keeps its RNG across calls so a
/// run is reproducible from its seed.
pub struct Generator {
    sampler: Sampler,
    processors: LogitsProcessorChain,
    max_new_tokens: usize,
}

impl Generator {
    pub fn new(sampler: Sampler, processors: LogitsProcessorChain, max_new_tokens: usize) -> Self {
        Self {
            sampler,
            processors,
            max_new_tokens,
        }
    }

    pub fn from_args(args: &TrainingArguments) -> Self {
        let sampler = Sampler::new(
            SamplerConfig {
                temperature: args.temperature,
                top_k: args.top_k,
                top_p: args.top_p,
            },
            args.seed,
        );
        Self::new(
            sampler,
            LogitsProcessorChain::from_args(args),
            args.max_new_tokens,
        )
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Sample continuations for one minibatch. Returns prompt + continuation
    /// token ids per row, with padding and EOS still in place.
    pub fn generate_batch<M: PolicyModel + ?Sized>(
        &mut self,
        model: &M,
        tokenizer: &TextTokenizer,
        prompts: &[String],
    ) -> TrainResult<Vec<Vec<u32>>> {
        let encoded = tokenizer.encode_batch_with_side(prompts, None, PaddingSide::Left)?;
        let eos = tokenizer.eos_token_id();
        let pad = tokenizer.pad_token_id().unwrap_or(eos);
        let mut ids = encoded.input_ids;
        let mut mask = encoded.attention_mask;
        if encoded_width(&ids) == 0 {
            // Every prompt was empty: seed each row with one masked pad column.
            for (row, m) in ids.iter_mut().zip(mask.iter_mut()) {
                row.push(pad);
                m.push(0);
            }
        }
        let mut finished = vec![false; ids.len()];

        for _ in 0..self.max_new_tokens {
            if finished.iter().all(|&f| f) {
                break;
            }
            let batch = rewardtune_common::EncodedBatch {
                input_ids: ids.clone(),
                attention_mask: mask.clone(),
            };
            let (input_ids, attention_mask) = batch.to_tensors(model.device())?;
            let t = batch.seq_len();
            let logits = model
                .forward(&input_ids, &attention_mask)?
                .i((.., t - 1, ..))?
                .detach()
                .to_dtype(candle_core::DType::F32)?
                .to_vec2::<f32>()?;

            for (row, mut row_logits) in logits.into_iter().enumerate() {
                if finished[row] {
                    ids[row].push(pad);
                    mask[row].push(0);
                    continue;
                }
                let history: Vec<u32> = ids[row]
                    .iter()
                    .zip(&mask[row])
                    .filter(|&(_, &m)| m == 1)
                    .map(|(&id, _)| id)
                    .collect();
                self.processors.apply(&history, &mut row_logits);
                let token = self.sampler.sample(&mut row_logits);
                ids[row].push(token);
                mask[row].push(1);
                if token == eos {
                    finished[row] = true;
                }
            }
        }
        Ok(ids)
    }
}

fn encoded_width(ids: &[Vec<u32>]) -> usize {
    ids.first().map_or(0, Vec::len)
}

/// Generate one completion per (already expanded) prompt, in input order.
///
/// Decoded texts contain the prompt followed by the continuation, special
/// tokens skipped.
pub fn generate_completions<M: PolicyModel + ?Sized>(
    model: &M,
    tokenizer: &TextTokenizer,
    generator: &mut Generator,
    prompts: &[String],
    minibatch_size: usize,
) -> TrainResult<Vec<String>> {
    let minibatch_size = minibatch_size.max(1);
    let mut completions = Vec::with_capacity(prompts.len());
    for (i, chunk) in prompts.chunks(minibatch_size).enumerate() {
        debug!(
            "Generating minibatch {i} ({} prompts, batch size {minibatch_size})",
            chunk.len()
        );
        let sequences = generator.generate_batch(model, tokenizer, chunk)?;
        completions.extend(tokenizer.batch_decode(&sequences, true)?);
    }
    Ok(completions)
}

/// Repeat each prompt `completions_per_prompt` times (contiguously), with
/// `conversation_prompt` prepended.
pub fn expand_prompts(
    prompts: &[String],
    conversation_prompt: &str,
    completions_per_prompt: usize,
) -> Vec<String> {
    prompts
        .iter()
        .flat_map(|p| {
            std::iter::repeat(format!("{conversation_prompt}{p}")).take(completions_per_prompt)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rewardtune_common::ModelConfig;
    use rewardtune_core::TinyCausalLm;

    fn setup() -> (TinyCausalLm, TextTokenizer) {
        let model = TinyCausalLm::new(&ModelConfig::default(), &Device::Cpu).unwrap();
        let mut tokenizer = TextTokenizer::byte_level();
        tokenizer.ensure_pad_token();
        (model, tokenizer)
    }

    #[test]
    fn expand_repeats_contiguously_with_prefix() {
        let prompts = vec!["a".to_string(), "b".to_string()];
        let out = expand_prompts(&prompts, "SYS ", 3);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], "SYS a");
        assert_eq!(out[2], "SYS a");
        assert_eq!(out[3], "SYS b");
    }

    #[test]
    fn generation_keeps_order_and_prompt_prefix() {
        let (model, tokenizer) = setup();
        let args = TrainingArguments {
            max_new_tokens: 4,
            ..Default::default()
        };
        let mut generator = Generator::from_args(&args);
        let prompts = vec!["first".to_string(), "a longer second".to_string(), "3".to_string()];
        let out = generate_completions(&model, &tokenizer, &mut generator, &prompts, 2).unwrap();
        assert_eq!(out.len(), 3);
        for (prompt, text) in prompts.iter().zip(&out) {
            assert!(text.starts_with(prompt.as_str()), "{text:?} should start with {prompt:?}");
        }
    }

    #[test]
    fn rows_are_padded_after_eos() {
        let (model, tokenizer) = setup();
        let args = TrainingArguments {
            max_new_tokens: 3,
            ..Default::default()
        };
        let mut generator = Generator::from_args(&args);
        let rows = generator
            .generate_batch(&model, &tokenizer, &["ab".to_string(), "abcd".to_string()])
            .unwrap();
        assert!(rows.iter().all(|r| r.len() == rows[0].len()));
        assert!(rows[0].len() <= 4 + 3);
    }

    #[test]
    fn empty_prompts_still_generate() {
        let (model, tokenizer) = setup();
        let args = TrainingArguments {
            max_new_tokens: 2,
            ..Default::default()
        };
        let mut generator = Generator::from_args(&args);
        let out =
            generate_completions(&model, &tokenizer, &mut generator, &[String::new()], 1).unwrap();
        assert_eq!(out.len(), 1);
    }
}
