//! Logits processors applied, in order, before sampling each token.

use std::collections::HashSet;

use rewardtune_common::TrainingArguments;

/// Adjusts one row of next-token logits given the row's token history
/// (prompt plus tokens generated so far, padding excluded).
pub trait LogitsProcessor: Send + Sync {
    fn process(&self, history: &[u32], logits: &mut [f32]);
}

/// Bans any token that would complete an n-gram already present in the history.
#[derive(Debug, Clone)]
pub struct NoRepeatNGram {
    pub n: usize,
}

impl LogitsProcessor for NoRepeatNGram {
    fn process(&self, history: &[u32], logits: &mut [f32]) {
        let n = self.n;
        if n == 0 || history.len() + 1 < n {
            return;
        }
        let prefix = &history[history.len() + 1 - n..];
        for window in history.windows(n) {
            if &window[..n - 1] == prefix {
                let banned = window[n - 1] as usize;
                if banned < logits.len() {
                    logits[banned] = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Divides positive (multiplies negative) logits of previously seen tokens.
#[derive(Debug, Clone)]
pub struct RepetitionPenalty {
    pub penalty: f32,
}

impl LogitsProcessor for RepetitionPenalty {
    fn process(&self, history: &[u32], logits: &mut [f32]) {
        let seen: HashSet<u32> = history.iter().copied().collect();
        for tok in seen {
            let idx = tok as usize;
            if idx < logits.len() {
                if logits[idx] > 0.0 {
                    logits[idx] /= self.penalty;
                } else {
                    logits[idx] *= self.penalty;
                }
            }
        }
    }
}

#[derive(Default)]
pub struct LogitsProcessorChain {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, processor: impl LogitsProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// N-gram blocking first, then repetition penalty; each only when enabled.
    pub fn from_args(args: &TrainingArguments) -> Self {
        let mut chain = Self::new();
        if args.no_repeat_ngram_size > 0 {
            chain = chain.push(NoRepeatNGram {
                n: args.no_repeat_ngram_size,
            });
        }
        if args.repetition_penalty > 1.0 {
            chain = chain.push(RepetitionPenalty {
                penalty: args.repetition_penalty as f32,
            });
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn apply(&self, history: &[u32], logits: &mut [f32]) {
        for processor in &self.processors {
            processor.process(history, logits);
        }
    }
}
