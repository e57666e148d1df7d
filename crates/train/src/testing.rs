//! Test doubles for the trainer tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor, Var};
use parking_lot::Mutex;

use rewardtune_common::ModelConfig;
use rewardtune_core::{PolicyModel, RewardModel, RewardOutput, TinyCausalLm};

use crate::hub::{HubError, HubResult, ModelHub};
use crate::metrics::{MetricsReporter, SuperbatchMetrics};

const FAVOURED_BYTE: usize = b'a' as usize;

pub fn conversation_prompts(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("\n\nHuman: q{i}\n\nAssistant:"))
        .collect()
}

/// Trainable tiny LM whose logits are biased towards `a`, so every sample is
/// `a` regardless of the seed. Counts forward passes made with the adapter off.
pub struct CountingPolicy {
    inner: TinyCausalLm,
    bias: Tensor,
    pub disabled_forwards: Arc<AtomicUsize>,
}

impl CountingPolicy {
    pub fn new() -> Self {
        let config = ModelConfig {
            vocab_size: 257,
            hidden_size: 16,
            lora_rank: 4,
            lora_alpha: 8.0,
        };
        let inner = TinyCausalLm::new(&config, &Device::Cpu).unwrap();
        let mut bias = vec![0f32; config.vocab_size];
        bias[FAVOURED_BYTE] = 40.0;
        let bias = Tensor::from_vec(bias, config.vocab_size, &Device::Cpu).unwrap();
        Self {
            inner,
            bias,
            disabled_forwards: Arc::default(),
        }
    }
}

impl PolicyModel for CountingPolicy {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        if !self.inner.adapter_enabled() {
            self.disabled_forwards.fetch_add(1, Ordering::SeqCst);
        }
        self.inner
            .forward(input_ids, attention_mask)?
            .broadcast_add(&self.bias)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    fn has_adapter(&self) -> bool {
        self.inner.has_adapter()
    }

    fn set_adapter_enabled(&self, enabled: bool) {
        self.inner.set_adapter_enabled(enabled)
    }

    fn adapter_enabled(&self) -> bool {
        self.inner.adapter_enabled()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn save_weights(&self, dir: &Path) -> anyhow::Result<()> {
        self.inner.save_weights(dir)
    }
}

/// Flattened values of every trainable variable, sorted for comparison.
pub fn weight_snapshot<M: PolicyModel + ?Sized>(model: &M) -> Vec<Vec<f32>> {
    let mut out: Vec<Vec<f32>> = model
        .trainable_vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect();
    out.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a[0].total_cmp(&b[0])));
    out
}

/// Returns three scores per example.
pub struct MalformedRewardModel;

impl RewardModel for MalformedRewardModel {
    fn score(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<RewardOutput> {
        Ok(RewardOutput::Scores(Tensor::zeros(
            (input_ids.dim(0)?, 3),
            DType::F32,
            input_ids.device(),
        )?))
    }
}

/// Always fails with a non-memory runtime error.
pub struct FailingRewardModel {
    pub calls: Arc<AtomicUsize>,
}

impl RewardModel for FailingRewardModel {
    fn score(&self, _input_ids: &Tensor, _attention_mask: &Tensor) -> Result<RewardOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(candle_core::Error::Msg("device lost".into()))
    }
}

/// Runs out of memory on batches larger than `max_batch`.
pub struct OomAboveRewardModel {
    pub max_batch: usize,
}

impl RewardModel for OomAboveRewardModel {
    fn score(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<RewardOutput> {
        let b = input_ids.dim(0)?;
        if b > self.max_batch {
            return Err(candle_core::Error::Msg("CUDA out of memory".into()));
        }
        Ok(RewardOutput::Scores(Tensor::ones(b, DType::F32, input_ids.device())?))
    }
}

/// Runs out of memory above `max_batch`; after `healthy_calls` successful
/// calls every further call fails with a non-memory runtime error.
pub struct OomThenFailingRewardModel {
    pub max_batch: usize,
    pub healthy_calls: usize,
    pub successes: AtomicUsize,
}

impl RewardModel for OomThenFailingRewardModel {
    fn score(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<RewardOutput> {
        let b = input_ids.dim(0)?;
        if b > self.max_batch {
            return Err(candle_core::Error::Msg("CUDA out of memory".into()));
        }
        if self.successes.fetch_add(1, Ordering::SeqCst) >= self.healthy_calls {
            return Err(candle_core::Error::Msg("device lost".into()));
        }
        Ok(RewardOutput::Scores(Tensor::ones(b, DType::F32, input_ids.device())?))
    }
}

/// Hub whose account lookup always fails.
pub struct UnreachableHub;

impl ModelHub for UnreachableHub {
    fn whoami(&self) -> HubResult<String> {
        Err(HubError::Other(anyhow::anyhow!("hub unreachable")))
    }

    fn upload(
        &self,
        _repo_id: &str,
        _commit_message: &str,
        _write: &mut dyn FnMut(&Path) -> anyhow::Result<()>,
    ) -> HubResult<String> {
        Err(HubError::Other(anyhow::anyhow!("hub unreachable")))
    }

    fn create_branch(&self, _repo_id: &str, _branch: &str) -> HubResult<String> {
        Err(HubError::Other(anyhow::anyhow!("hub unreachable")))
    }

    fn delete_branch(&self, _repo_id: &str, _branch: &str) -> HubResult<()> {
        Err(HubError::Other(anyhow::anyhow!("hub unreachable")))
    }
}

#[derive(Clone, Default)]
pub struct RecordingReporter(Arc<Mutex<Vec<SuperbatchMetrics>>>);

impl RecordingReporter {
    pub fn records(&self) -> Vec<SuperbatchMetrics> {
        self.0.lock().clone()
    }
}

impl MetricsReporter for RecordingReporter {
    fn name(&self) -> &str {
        "recording"
    }

    fn report(&self, metrics: &SuperbatchMetrics) -> anyhow::Result<()> {
        self.0.lock().push(metrics.clone());
        Ok(())
    }
}

pub struct FailingReporter;

impl MetricsReporter for FailingReporter {
    fn name(&self) -> &str {
        "failing"
    }

    fn report(&self, _metrics: &SuperbatchMetrics) -> anyhow::Result<()> {
        anyhow::bail!("sink unavailable")
    }
}
