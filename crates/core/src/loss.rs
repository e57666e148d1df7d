//! Masked next-token loss and reference-policy KL.
//!
//! Labels use [`IGNORE_INDEX`] for positions that must not contribute (the
//! prompt and padding). Logits at position `i` predict the label at `i + 1`,
//! so both the loss and the KL are computed over the shifted positions whose
//! label is kept.

use candle_core::{DType, Device, Result, Tensor, D};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Next-token targets `(b, t-1)` and the matching 0/1 loss mask.
#[derive(Debug, Clone)]
pub struct ShiftedTargets {
    pub targets: Tensor,
    pub mask: Tensor,
    /// Number of kept positions across the batch.
    pub count: usize,
}

impl ShiftedTargets {
    pub fn from_labels(labels: &[Vec<i64>], device: &Device) -> Result<Self> {
        let b = labels.len();
        let t = labels.first().map_or(0, Vec::len);
        if t < 2 {
            candle_core::bail!("need at least two positions to shift labels, got {t}");
        }
        let mut targets = Vec::with_capacity(b * (t - 1));
        let mut mask = Vec::with_capacity(b * (t - 1));
        let mut count = 0;
        for row in labels {
            if row.len() != t {
                candle_core::bail!("ragged label rows: expected {t}, got {}", row.len());
            }
            for &label in &row[1..] {
                if label == IGNORE_INDEX {
                    targets.push(0u32);
                    mask.push(0f32);
                } else {
                    targets.push(label as u32);
                    mask.push(1f32);
                    count += 1;
                }
            }
        }
        Ok(Self {
            targets: Tensor::from_vec(targets, (b, t - 1), device)?,
            mask: Tensor::from_vec(mask, (b, t - 1), device)?,
            count,
        })
    }
}

/// Log-probabilities `(b, t-1, vocab)` of the shifted prediction positions.
pub fn shifted_log_probs(logits: &Tensor) -> Result<Tensor> {
    let t = logits.dim(1)?;
    let logits = logits.narrow(1, 0, t - 1)?.to_dtype(DType::F32)?;
    candle_nn::ops::log_softmax(&logits, D::Minus1)
}

/// Mean negative log-likelihood over kept positions.
///
/// With no kept positions the loss is NaN, which the fine-tuning guard
/// treats as an invalid minibatch.
pub fn masked_lm_loss(log_probs: &Tensor, targets: &ShiftedTargets) -> Result<Tensor> {
    if targets.count == 0 {
        return Tensor::new(f32::NAN, log_probs.device());
    }
    let picked = log_probs
        .gather(&targets.targets.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    let total = (picked * &targets.mask)?.sum_all()?;
    total.affine(-1.0 / targets.count as f64, 0.0)
}

/// Per-example KL(reference ‖ policy) `(b,)`, averaged over each example's
/// kept positions. Both inputs are log-probabilities.
pub fn token_kl_divergence(
    policy_log_probs: &Tensor,
    reference_log_probs: &Tensor,
    mask: &Tensor,
) -> Result<Tensor> {
    let diff = (reference_log_probs - policy_log_probs)?;
    let per_position = (reference_log_probs.exp()? * diff)?.sum(D::Minus1)?;
    let summed = (per_position * mask)?.sum(1)?;
    let counts = mask.sum(1)?.maximum(1.0)?;
    summed / counts
}

/// Clamp KL estimates at zero; sampling noise can push them negative.
pub fn clamp_kl(kl: &Tensor) -> Result<Tensor> {
    kl.maximum(0.0)
}
