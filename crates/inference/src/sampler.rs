//! Decoding strategies: greedy, top-k, top-p, temperature.
//!
//! Operates on one row of logits at a time; history-dependent adjustments
//! (repetition penalty, n-gram blocking) live in [`crate::processors`] and
//! run before the sampler.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub temperature: f64,
    /// 0 disables the top-k cut.
    pub top_k: usize,
    pub top_p: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.95,
        }
    }
}

pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample one token id from a row of logits. The row is modified in place.
    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        // Greedy if temperature ~0
        if self.config.temperature < 1e-6 {
            return argmax(logits);
        }

        let temp = self.config.temperature as f32;
        for v in logits.iter_mut() {
            *v /= temp;
        }

        // Top-k filter
        if self.config.top_k > 0 && self.config.top_k < logits.len() {
            let mut sorted: Vec<f32> = logits.to_vec();
            sorted.sort_unstable_by(|a, b| b.total_cmp(a));
            let threshold = sorted[self.config.top_k - 1];
            for v in logits.iter_mut() {
                if *v < threshold {
                    *v = f32::NEG_INFINITY;
                }
            }
        }

        // Softmax
        let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max_val.is_finite() {
            return argmax(logits);
        }
        let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
        normalise(&mut probs);

        // Top-p (nucleus) filter: keep the smallest prefix reaching top_p.
        if self.config.top_p < 1.0 {
            let mut order: Vec<usize> = (0..probs.len()).collect();
            order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let mut cumsum = 0.0;
            let mut cut = order.len();
            for (rank, &idx) in order.iter().enumerate() {
                cumsum += probs[idx];
                if cumsum >= self.config.top_p as f32 {
                    cut = rank + 1;
                    break;
                }
            }
            for &idx in &order[cut..] {
                probs[idx] = 0.0;
            }
            normalise(&mut probs);
        }

        self.weighted_sample(&probs)
    }

    fn weighted_sample(&mut self, probs: &[f32]) -> u32 {
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;
        let mut last_nonzero = 0;
        for (i, &p) in probs.iter().enumerate() {
            if p > 0.0 {
                last_nonzero = i;
            }
            cumsum += p;
            if cumsum >= r && p > 0.0 {
                return i as u32;
            }
        }
        last_nonzero as u32
    }
}

fn normalise(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

pub fn argmax(v: &[f32]) -> u32 {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}
