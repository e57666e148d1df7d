//! # rewardtune-core: Models, Losses and Errors
//!
//! The compute surface the expert-iteration loop is written against:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`error`] | `TrainError` tagged hierarchy, `TrainResult` |
//! | [`model`] | `PolicyModel` capability, `AdapterDisabled` guard, `TinyCausalLm` |
//! | [`lora`] | `LoraLinear` low-rank adapter over a frozen projection |
//! | [`reward`] | `RewardModel` capability, `RewardOutput`, pooled / preference-choice / heuristic models |
//! | [`loss`] | masked next-token loss, per-example KL against the reference policy |
//!
//! ## Design principles
//!
//! 1. **Capabilities, not concrete models.** The trainer sees traits; any
//!    candle model implementing them can be plugged in.
//! 2. **Classify errors once.** `candle_core::Error` is mapped to a tagged
//!    `TrainError` at the boundary; nothing downstream parses messages.
//! 3. **Scoped reference policy.** The adapter is switched off through a
//!    drop guard, so it is restored on every exit path.

pub mod error;
pub mod lora;
pub mod loss;
pub mod model;
pub mod reward;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use error::{TrainError, TrainResult};
pub use lora::LoraLinear;
pub use loss::{clamp_kl, masked_lm_loss, token_kl_divergence, ShiftedTargets, IGNORE_INDEX};
pub use model::{reference_log_probs, AdapterDisabled, PolicyModel, TinyCausalLm};
pub use reward::{
    HeuristicRewardModel, PooledRewardModel, PreferenceChoiceRewardModel, RewardModel,
    RewardOutput, ScoreReadout,
};
