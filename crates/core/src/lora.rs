//! Low-rank adapter on a frozen linear projection.
//!
//! `y = W x + scale · B (A x)` with `A: (rank, in)` initialised small and
//! `B: (out, rank)` initialised to zero, so a fresh adapter is a no-op.
//! Disabling the adapter yields exactly the base projection, which is the
//! reference policy for the KL term.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

const LORA_A_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

struct Adapter {
    a: Linear,
    b: Linear,
    scale: f64,
}

pub struct LoraLinear {
    base: Linear,
    adapter: Option<Adapter>,
    enabled: AtomicBool,
}

impl LoraLinear {
    /// `rank == 0` builds a plain linear layer with no adapter.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        rank: usize,
        alpha: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let base = candle_nn::linear_no_bias(in_dim, out_dim, vb.pp("base"))?;
        let adapter = if rank > 0 {
            let a = vb.get_with_hints((rank, in_dim), "lora_a", LORA_A_INIT)?;
            let b = vb.get_with_hints((out_dim, rank), "lora_b", Init::Const(0.))?;
            Some(Adapter {
                a: Linear::new(a, None),
                b: Linear::new(b, None),
                scale: alpha / rank as f64,
            })
        } else {
            None
        };
        Ok(Self {
            base,
            adapter,
            enabled: AtomicBool::new(true),
        })
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn adapter_enabled(&self) -> bool {
        self.adapter.is_some() && self.enabled.load(Ordering::SeqCst)
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.base.forward(x)?;
        match &self.adapter {
            Some(adapter) if self.enabled.load(Ordering::SeqCst) => {
                let delta = adapter.b.forward(&adapter.a.forward(x)?)?;
                y + delta.affine(adapter.scale, 0.0)?
            }
            _ => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn fresh_adapter_matches_base() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LoraLinear::new(4, 3, 2, 4.0, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 4), &Device::Cpu).unwrap();
        let with = layer.forward(&x).unwrap();
        layer.set_adapter_enabled(false);
        let without = layer.forward(&x).unwrap();
        let diff = (with - without)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn rank_zero_has_no_adapter() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LoraLinear::new(4, 3, 0, 16.0, vb).unwrap();
        assert!(!layer.has_adapter());
        assert!(!layer.adapter_enabled());
        assert_eq!(varmap.all_vars().len(), 1);
    }
}
