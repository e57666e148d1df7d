//! Completion filters: pick the fine-tuning targets from each prompt's group.

use tracing::debug;

use rewardtune_core::{TrainError, TrainResult};

/// Scores, completions and lengths of one prompt's candidates (parallel).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredGroup {
    pub scores: Vec<f32>,
    pub completions: Vec<String>,
    pub lengths: Vec<usize>,
}

impl ScoredGroup {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn push(&mut self, score: f32, completion: String, length: usize) {
        self.scores.push(score);
        self.completions.push(completion);
        self.lengths.push(length);
    }

    fn extend(&mut self, other: ScoredGroup) {
        self.scores.extend(other.scores);
        self.completions.extend(other.completions);
        self.lengths.extend(other.lengths);
    }
}

/// Deterministic selection over one non-empty group.
pub trait CompletionFilter {
    fn filter(&self, group: &ScoredGroup) -> TrainResult<ScoredGroup>;
}

/// Keep the `k` highest-scoring completions, best first. Ties keep input order.
#[derive(Debug, Clone)]
pub struct TopKFilter {
    pub k: usize,
}

impl CompletionFilter for TopKFilter {
    fn filter(&self, group: &ScoredGroup) -> TrainResult<ScoredGroup> {
        if group.is_empty() {
            return Err(TrainError::EmptyGroup);
        }
        let mut order: Vec<usize> = (0..group.len()).collect();
        order.sort_by(|&a, &b| group.scores[b].total_cmp(&group.scores[a]));
        let mut out = ScoredGroup::default();
        for &i in order.iter().take(self.k) {
            out.push(group.scores[i], group.completions[i].clone(), group.lengths[i]);
        }
        Ok(out)
    }
}

/// Keep every completion scoring at least `threshold`, in input order.
/// May return an empty group.
#[derive(Debug, Clone)]
pub struct ThresholdFilter {
    pub threshold: f32,
}

impl CompletionFilter for ThresholdFilter {
    fn filter(&self, group: &ScoredGroup) -> TrainResult<ScoredGroup> {
        if group.is_empty() {
            return Err(TrainError::EmptyGroup);
        }
        let mut out = ScoredGroup::default();
        for i in 0..group.len() {
            if group.scores[i] >= self.threshold {
                out.push(group.scores[i], group.completions[i].clone(), group.lengths[i]);
            }
        }
        Ok(out)
    }
}

/// Filter a whole superbatch. Prompt `i` owns the contiguous slice
/// `[i * group_size, (i + 1) * group_size)`. Zero-length completions are
/// dropped first; a group left empty is skipped.
pub fn filter_superbatch(
    filter: &dyn CompletionFilter,
    group_size: usize,
    scored: &ScoredGroup,
) -> TrainResult<ScoredGroup> {
    let group_size = group_size.max(1);
    let mut out = ScoredGroup::default();
    for (prompt_index, start) in (0..scored.len()).step_by(group_size).enumerate() {
        let end = (start + group_size).min(scored.len());
        let mut group = ScoredGroup::default();
        for i in start..end {
            if scored.lengths[i] > 0 {
                group.push(scored.scores[i], scored.completions[i].clone(), scored.lengths[i]);
            }
        }
        if group.is_empty() {
            debug!("Prompt {prompt_index}: every completion was empty, skipping");
            continue;
        }
        out.extend(filter.filter(&group)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(scores: &[f32]) -> ScoredGroup {
        ScoredGroup {
            scores: scores.to_vec(),
            completions: (0..scores.len()).map(|i| format!("c{i}")).collect(),
            lengths: vec![3; scores.len()],
        }
    }

    #[test]
    fn top_k_property() {
        let g = group(&[0.2, 1.5, -0.3, 0.9, 1.5]);
        for k in 1..=6 {
            let out = TopKFilter { k }.filter(&g).unwrap();
            assert_eq!(out.scores.len(), out.completions.len());
            assert_eq!(out.scores.len(), out.lengths.len());
            assert!(out.len() <= g.len());
            let min_kept = out.scores.iter().copied().fold(f32::INFINITY, f32::min);
            let mut discarded = g.scores.clone();
            for s in &out.scores {
                let pos = discarded.iter().position(|d| d == s).unwrap();
                discarded.remove(pos);
            }
            assert!(discarded.iter().all(|&d| d <= min_kept));
        }
    }

    #[test]
    fn top_k_ties_keep_input_order() {
        let g = group(&[1.0, 2.0, 2.0]);
        let out = TopKFilter { k: 1 }.filter(&g).unwrap();
        assert_eq!(out.completions, vec!["c1"]);
    }

    #[test]
    fn empty_group_is_an_error() {
        let err = TopKFilter { k: 1 }.filter(&ScoredGroup::default()).unwrap_err();
        assert!(matches!(err, TrainError::EmptyGroup));
        let err = ThresholdFilter { threshold: 0.0 }
            .filter(&ScoredGroup::default())
            .unwrap_err();
        assert!(matches!(err, TrainError::EmptyGroup));
    }

    #[test]
    fn threshold_may_keep_nothing() {
        let out = ThresholdFilter { threshold: 5.0 }.filter(&group(&[1.0, 2.0])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn superbatch_groups_are_contiguous() {
        let scored = group(&[0.1, 0.9, 0.8, 0.2, 0.5, 0.4, 0.0, 0.3]);
        let out = filter_superbatch(&TopKFilter { k: 1 }, 2, &scored).unwrap();
        assert_eq!(out.completions, vec!["c1", "c2", "c4", "c7"]);
    }

    #[test]
    fn zero_length_completions_are_dropped_and_empty_groups_skipped() {
        let mut scored = group(&[5.0, 0.1, 9.0, 9.0]);
        scored.lengths = vec![0, 2, 0, 0];
        let out = filter_superbatch(&TopKFilter { k: 1 }, 2, &scored).unwrap();
        assert_eq!(out.completions, vec!["c1"]);
        assert_eq!(out.scores, vec![0.1]);
    }
}
