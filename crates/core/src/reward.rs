//! Reward-model capability and implementations.
//!
//! A reward model maps tokenised text to one scalar per example. Models
//! differ in what they hand back: a raw score tensor, a classifier output
//! wrapping logits, or (for preference-choice models) the next-token
//! distribution read at a single vocabulary index. [`RewardOutput::into_scores`]
//! normalises all three and rejects anything that does not fit.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use tracing::debug;

use rewardtune_common::ModelConfig;

use crate::error::{TrainError, TrainResult};
use crate::model::PolicyModel;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";

/// Raw output of a reward-model forward pass.
#[derive(Debug, Clone)]
pub enum RewardOutput {
    /// `(b,)` or `(b, 1)` scores.
    Scores(Tensor),
    /// Sequence-classifier output; `logits` is `(b, 1)`.
    Classifier { logits: Tensor },
    /// Next-token logits `(b, vocab)` of a single generated position.
    FirstTokenLogits(Tensor),
}

/// How scores are read out of a [`RewardOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreReadout {
    Direct,
    /// Softmax probability of `token_id` at the first generated position.
    PreferenceChoice { token_id: u32 },
}

impl RewardOutput {
    pub fn into_scores(self, readout: ScoreReadout, expected: usize) -> TrainResult<Vec<f32>> {
        let scores = match (self, readout) {
            (RewardOutput::Scores(t), ScoreReadout::Direct)
            | (RewardOutput::Classifier { logits: t }, ScoreReadout::Direct) => {
                match t.dims() {
                    [_] => {}
                    [_, 1] => {}
                    dims => {
                        return Err(TrainError::MalformedScoringOutput(format!(
                            "expected one score per example, got shape {dims:?}"
                        )))
                    }
                }
                t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?
            }
            (RewardOutput::FirstTokenLogits(t), ScoreReadout::PreferenceChoice { token_id }) => {
                let (_b, vocab) = t.dims2().map_err(|_| {
                    TrainError::MalformedScoringOutput(format!(
                        "expected (batch, vocab) logits, got shape {:?}",
                        t.dims()
                    ))
                })?;
                let index = token_id as usize;
                if index >= vocab {
                    return Err(TrainError::MalformedScoringOutput(format!(
                        "preference token {token_id} outside vocabulary of {vocab}"
                    )));
                }
                let probs = candle_nn::ops::softmax(&t.to_dtype(DType::F32)?, D::Minus1)?;
                probs.i((.., index))?.to_vec1::<f32>()?
            }
            (RewardOutput::FirstTokenLogits(_), ScoreReadout::Direct) => {
                return Err(TrainError::MalformedScoringOutput(
                    "got next-token logits from a direct-score reward model".into(),
                ))
            }
            (_, ScoreReadout::PreferenceChoice { .. }) => {
                return Err(TrainError::MalformedScoringOutput(
                    "preference-choice readout needs next-token logits".into(),
                ))
            }
        };
        if scores.len() != expected {
            return Err(TrainError::MalformedScoringOutput(format!(
                "expected {expected} scores, got {}",
                scores.len()
            )));
        }
        Ok(scores)
    }
}

/// Scores tokenised text. Read-only: scoring never mutates the model.
pub trait RewardModel {
    /// `input_ids: u32 (b, t)`, `attention_mask: f32 (b, t)`.
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<RewardOutput>;

    /// Device the input tensors are built on.
    fn device(&self) -> Device {
        Device::Cpu
    }
}

// ── PooledRewardModel ───────────────────────────────────────────────────────

/// Mean-pooled embedding followed by a scalar head.
pub struct PooledRewardModel {
    wte: Embedding,
    head: Linear,
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
}

impl PooledRewardModel {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let head = linear(config.hidden_size, 1, vb.pp("score"))?;
        Ok(Self {
            wte,
            head,
            varmap,
            config: config.clone(),
            device: device.clone(),
        })
    }

    pub fn load(dir: &Path, device: &Device) -> anyhow::Result<Self> {
        let config = ModelConfig::load(&dir.join(CONFIG_FILE))?;
        let mut model = Self::new(&config, device)?;
        model.varmap.load(dir.join(WEIGHTS_FILE))?;
        debug!("Loaded reward model from {}", dir.display());
        Ok(model)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        Ok(())
    }
}

impl RewardModel for PooledRewardModel {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<RewardOutput> {
        let emb = self.wte.forward(input_ids)?;
        let mask = attention_mask.unsqueeze(2)?;
        let summed = emb.broadcast_mul(&mask)?.sum(1)?;
        let counts = attention_mask.sum_keepdim(1)?.maximum(1.0)?;
        let pooled = summed.broadcast_div(&counts)?;
        let logits = self.head.forward(&pooled)?;
        Ok(RewardOutput::Classifier { logits })
    }

    fn device(&self) -> Device {
        self.device.clone()
    }
}

// ── PreferenceChoiceRewardModel ─────────────────────────────────────────────

/// Two-choice preference model: a causal LM asked "which response is
/// better?", read at the position right after the prompt.
pub struct PreferenceChoiceRewardModel<M> {
    model: M,
}

impl<M: PolicyModel> PreferenceChoiceRewardModel<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: PolicyModel> RewardModel for PreferenceChoiceRewardModel<M> {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<RewardOutput> {
        let logits = self.model.forward(input_ids, attention_mask)?;
        let mask = attention_mask.to_vec2::<f32>()?;
        let mut rows = Vec::with_capacity(mask.len());
        for (row, m) in mask.iter().enumerate() {
            let last = m.iter().rposition(|&v| v > 0.0).unwrap_or(0);
            rows.push(logits.i((row, last))?);
        }
        Ok(RewardOutput::FirstTokenLogits(Tensor::stack(&rows, 0)?))
    }

    fn device(&self) -> Device {
        self.model.device().clone()
    }
}

// ── HeuristicRewardModel ────────────────────────────────────────────────────

/// Deterministic stand-in for mock runs: rewards lexical variety, i.e. the
/// number of distinct tokens over the square root of the sequence length.
#[derive(Debug, Default, Clone)]
pub struct HeuristicRewardModel;

impl RewardModel for HeuristicRewardModel {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<RewardOutput> {
        let ids = input_ids.to_vec2::<u32>()?;
        let mask = attention_mask.to_vec2::<f32>()?;
        let scores: Vec<f32> = ids
            .iter()
            .zip(&mask)
            .map(|(row, m)| {
                let real: Vec<u32> = row
                    .iter()
                    .zip(m)
                    .filter(|&(_, &v)| v > 0.0)
                    .map(|(&id, _)| id)
                    .collect();
                if real.is_empty() {
                    return 0.0;
                }
                let mut distinct = real.clone();
                distinct.sort_unstable();
                distinct.dedup();
                distinct.len() as f32 / (real.len() as f32).sqrt()
            })
            .collect();
        let n = scores.len();
        Ok(RewardOutput::Scores(Tensor::from_vec(
            scores,
            n,
            input_ids.device(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TinyCausalLm;

    fn batch() -> (Tensor, Tensor) {
        let ids = Tensor::new(&[[1u32, 2, 3, 0], [4, 4, 0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 0.], [1., 1., 0., 0.]], &Device::Cpu).unwrap();
        (ids, mask)
    }

    #[test]
    fn classifier_logits_flatten() {
        let logits = Tensor::new(&[[0.5f32], [-1.0]], &Device::Cpu).unwrap();
        let scores = RewardOutput::Classifier { logits }
            .into_scores(ScoreReadout::Direct, 2)
            .unwrap();
        assert_eq!(scores, vec![0.5, -1.0]);
    }

    #[test]
    fn wrong_count_is_malformed() {
        let t = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let err = RewardOutput::Scores(t)
            .into_scores(ScoreReadout::Direct, 2)
            .unwrap_err();
        assert!(err.is_malformed_output());
    }

    #[test]
    fn wide_scores_are_malformed() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = RewardOutput::Scores(t)
            .into_scores(ScoreReadout::Direct, 2)
            .unwrap_err();
        assert!(err.is_malformed_output());
    }

    #[test]
    fn preference_readout_is_softmax_probability() {
        let logits = Tensor::new(&[[0f32, 0., 0., 0.], [10., 0., 0., 0.]], &Device::Cpu).unwrap();
        let scores = RewardOutput::FirstTokenLogits(logits)
            .into_scores(ScoreReadout::PreferenceChoice { token_id: 0 }, 2)
            .unwrap();
        assert!((scores[0] - 0.25).abs() < 1e-5);
        assert!(scores[1] > 0.99);
    }

    #[test]
    fn preference_token_out_of_vocab_is_malformed() {
        let logits = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let err = RewardOutput::FirstTokenLogits(logits)
            .into_scores(ScoreReadout::PreferenceChoice { token_id: 71 }, 1)
            .unwrap_err();
        assert!(err.is_malformed_output());
    }

    #[test]
    fn flavour_mismatch_is_malformed() {
        let logits = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(RewardOutput::FirstTokenLogits(logits)
            .into_scores(ScoreReadout::Direct, 1)
            .unwrap_err()
            .is_malformed_output());
    }

    #[test]
    fn pooled_model_scores_each_example() {
        let model = PooledRewardModel::new(&ModelConfig::default(), &Device::Cpu).unwrap();
        let (ids, mask) = batch();
        let scores = model
            .score(&ids, &mask)
            .unwrap()
            .into_scores(ScoreReadout::Direct, 2)
            .unwrap();
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn preference_model_reads_last_real_position() {
        let config = ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            lora_rank: 0,
            lora_alpha: 1.0,
        };
        let lm = TinyCausalLm::new(&config, &Device::Cpu).unwrap();
        let model = PreferenceChoiceRewardModel::new(lm);
        let (ids, mask) = batch();
        match model.score(&ids, &mask).unwrap() {
            RewardOutput::FirstTokenLogits(t) => assert_eq!(t.dims(), &[2, 16]),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn heuristic_prefers_variety() {
        let (ids, mask) = batch();
        let scores = HeuristicRewardModel
            .score(&ids, &mask)
            .unwrap()
            .into_scores(ScoreReadout::Direct, 2)
            .unwrap();
        assert!(scores[0] > scores[1]);
    }
}
