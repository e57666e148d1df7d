//! Policy-model capability and a small built-in causal LM.
//!
//! The trainer only sees [`PolicyModel`]: a forward pass to per-token logits,
//! the variables the optimiser may touch, and an adapter switch. Disabling
//! the adapter turns the policy into its own frozen reference.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{embedding, Embedding, Module, VarBuilder, VarMap};
use tracing::debug;

use rewardtune_common::ModelConfig;

use crate::lora::LoraLinear;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";

// ── PolicyModel ─────────────────────────────────────────────────────────────

/// Language model the expert-iteration loop samples from and fine-tunes.
pub trait PolicyModel {
    /// `input_ids: u32 (b, t)`, `attention_mask: f32 (b, t)` → logits `(b, t, vocab)`.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Variables updated by fine-tuning (the adapter only, when one exists).
    fn trainable_vars(&self) -> Vec<Var>;

    fn has_adapter(&self) -> bool;

    fn set_adapter_enabled(&self, enabled: bool);

    fn adapter_enabled(&self) -> bool;

    fn device(&self) -> &Device;

    /// Persist weights and config into `dir`.
    fn save_weights(&self, dir: &Path) -> anyhow::Result<()>;
}

/// Scoped adapter switch-off. The previous state is restored on drop, which
/// also covers early returns through `?`.
pub struct AdapterDisabled<'a, M: PolicyModel + ?Sized> {
    model: &'a M,
    previous: bool,
}

impl<'a, M: PolicyModel + ?Sized> AdapterDisabled<'a, M> {
    pub fn new(model: &'a M) -> Self {
        let previous = model.adapter_enabled();
        model.set_adapter_enabled(false);
        Self { model, previous }
    }
}

impl<M: PolicyModel + ?Sized> Drop for AdapterDisabled<'_, M> {
    fn drop(&mut self) {
        self.model.set_adapter_enabled(self.previous);
    }
}

/// Log-probabilities `(b, t, vocab)` of the reference policy (adapter off),
/// detached from the autograd graph.
pub fn reference_log_probs<M: PolicyModel + ?Sized>(
    model: &M,
    input_ids: &Tensor,
    attention_mask: &Tensor,
) -> Result<Tensor> {
    let _guard = AdapterDisabled::new(model);
    let logits = model.forward(input_ids, attention_mask)?;
    Ok(candle_nn::ops::log_softmax(&logits, candle_core::D::Minus1)?.detach())
}

// ── TinyCausalLm ────────────────────────────────────────────────────────────

/// Embedding + masked causal prefix-mean context + LoRA LM head.
///
/// Small enough to train on CPU in tests and mock runs, yet it exercises the
/// same capability surface as a full transformer.
pub struct TinyCausalLm {
    wte: Embedding,
    head: LoraLinear,
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
}

impl TinyCausalLm {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let head = LoraLinear::new(
            config.hidden_size,
            config.vocab_size,
            config.lora_rank,
            config.lora_alpha,
            vb.pp("lm_head"),
        )?;
        Ok(Self {
            wte,
            head,
            varmap,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Restore a model saved with [`PolicyModel::save_weights`].
    pub fn load(dir: &Path, device: &Device) -> anyhow::Result<Self> {
        let config = ModelConfig::load(&dir.join(CONFIG_FILE))?;
        let mut model = Self::new(&config, device)?;
        model.varmap.load(dir.join(WEIGHTS_FILE))?;
        debug!(
            "Loaded policy from {} (vocab={}, hidden={}, lora_rank={})",
            dir.display(),
            config.vocab_size,
            config.hidden_size,
            config.lora_rank
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Hidden states `(b, t, hidden)`: each position mixes its own embedding
    /// with the mean embedding of the unmasked positions up to and including it.
    pub fn hidden_states(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        let emb = self.wte.forward(input_ids)?;
        let causal = Tensor::tril2(t, DType::F32, input_ids.device())?;
        let weights = causal.broadcast_mul(&attention_mask.unsqueeze(1)?)?;
        let denom = weights.sum_keepdim(2)?.maximum(1.0)?;
        let weights = weights.broadcast_div(&denom)?;
        let context = weights.matmul(&emb)?;
        (emb + context)?.tanh()
    }
}

impl PolicyModel for TinyCausalLm {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden_states(input_ids, attention_mask)?;
        self.head.forward(&hidden)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        if !self.head.has_adapter() {
            return self.varmap.all_vars();
        }
        let vars = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        vars.iter()
            .filter(|(name, _)| name.contains("lora_"))
            .map(|(_, var)| var.clone())
            .collect()
    }

    fn has_adapter(&self) -> bool {
        self.head.has_adapter()
    }

    fn set_adapter_enabled(&self, enabled: bool) {
        self.head.set_adapter_enabled(enabled);
    }

    fn adapter_enabled(&self) -> bool {
        self.head.adapter_enabled()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn save_weights(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(rank: usize) -> TinyCausalLm {
        let config = ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            lora_rank: rank,
            lora_alpha: 8.0,
        };
        TinyCausalLm::new(&config, &Device::Cpu).unwrap()
    }

    fn inputs() -> (Tensor, Tensor) {
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [0, 0, 5, 6]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 1.], [0., 0., 1., 1.]], &Device::Cpu).unwrap();
        (ids, mask)
    }

    #[test]
    fn forward_shape() {
        let model = tiny(2);
        let (ids, mask) = inputs();
        let logits = model.forward(&ids, &mask).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 16]);
    }

    #[test]
    fn trainable_vars_are_adapter_only() {
        assert_eq!(tiny(2).trainable_vars().len(), 2);
        // Without an adapter everything trains: embedding + head.
        assert_eq!(tiny(0).trainable_vars().len(), 2);
        assert!(!tiny(0).has_adapter());
    }

    #[test]
    fn guard_restores_adapter_state() {
        let model = tiny(2);
        assert!(model.adapter_enabled());
        {
            let _guard = AdapterDisabled::new(&model);
            assert!(!model.adapter_enabled());
        }
        assert!(model.adapter_enabled());
    }

    #[test]
    fn guard_restores_on_error_path() {
        fn failing(model: &TinyCausalLm) -> Result<()> {
            let _guard = AdapterDisabled::new(model);
            Err(candle_core::Error::Msg("boom".into()))
        }
        let model = tiny(2);
        assert!(failing(&model).is_err());
        assert!(model.adapter_enabled());
    }

    #[test]
    fn reference_log_probs_normalise() {
        let model = tiny(2);
        let (ids, mask) = inputs();
        let lp = reference_log_probs(&model, &ids, &mask).unwrap();
        let total = lp.exp().unwrap().sum(2).unwrap().to_vec2::<f32>().unwrap();
        for row in total {
            for v in row {
                assert!((v - 1.0).abs() < 1e-4);
            }
        }
        assert!(model.adapter_enabled());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let model = tiny(2);
        model.save_weights(dir.path()).unwrap();
        let loaded = TinyCausalLm::load(dir.path(), &Device::Cpu).unwrap();
        let (ids, mask) = inputs();
        let a = model.forward(&ids, &mask).unwrap();
        let b = loaded.forward(&ids, &mask).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }
}
