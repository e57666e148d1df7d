//! Scoring stage: trim raw generations and score them with the reward models.

use tracing::debug;

use rewardtune_common::{
    split_after_prompt, trim_completion, BoundaryPolicy, PaddingSide, TextTokenizer,
    TrainingArguments,
};
use rewardtune_core::{RewardModel, ScoreReadout, TrainError, TrainResult};

use crate::filter::ScoredGroup;

/// A raw generation re-split, trimmed and formatted for the reward model.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCompletion {
    /// Prompt + " " + trimmed completion; the fine-tuning text.
    pub joined: String,
    /// Text actually fed to the train reward model.
    pub reward_input: String,
    /// Characters in the trimmed completion alone.
    pub length: usize,
}

/// Two-choice preference format: response A is the candidate, response B a
/// placeholder, and the model is asked which is better.
pub fn preference_choice_prompt(
    prompt: &str,
    completion: &str,
    human_delimiter: &str,
    prompt_delimiter: &str,
) -> TrainResult<String> {
    let after_human = prompt.split(human_delimiter).nth(1).ok_or_else(|| {
        TrainError::MalformedScoringOutput(format!(
            "prompt has no {human_delimiter:?} turn to build a preference query from"
        ))
    })?;
    let prompt_only = after_human.split(prompt_delimiter).next().unwrap_or_default();
    Ok(format!(
        "POST:{prompt_only}\n\n RESPONSE A: {completion}\n\n RESPONSE B: .\n\n Which response is better? RESPONSE"
    ))
}

/// Split `raw` after the prompt that generated it, cut the continuation at
/// its first turn boundary and re-join.
pub fn prepare_completion(
    raw: &str,
    prompt: &str,
    args: &TrainingArguments,
) -> TrainResult<PreparedCompletion> {
    let (prompt, completion) = split_after_prompt(raw, prompt, &args.prompt_delimiter);
    let trimmed = trim_completion(completion, BoundaryPolicy::Medium);
    let joined = format!("{prompt} {trimmed}");
    let reward_input = if args.reward_model_is_steamshp {
        preference_choice_prompt(prompt, &trimmed, &args.human_delimiter, &args.prompt_delimiter)?
    } else {
        joined.clone()
    };
    Ok(PreparedCompletion {
        joined,
        reward_input,
        length: trimmed.chars().count(),
    })
}

/// `score -= penalty * ln(length)` for positive penalties and non-empty completions.
pub fn apply_length_penalty(scores: &mut [f32], lengths: &[usize], penalty: f64) {
    if penalty <= 0.0 {
        return;
    }
    for (score, &length) in scores.iter_mut().zip(lengths) {
        if length > 0 {
            *score -= (penalty * (length as f64).ln()) as f32;
        }
    }
}

fn score_texts(
    model: &dyn RewardModel,
    tokenizer: &TextTokenizer,
    texts: &[String],
    max_length: usize,
    readout: ScoreReadout,
) -> TrainResult<Vec<f32>> {
    let batch = tokenizer.encode_batch_with_side(texts, Some(max_length), PaddingSide::Right)?;
    let (ids, mask) = batch.to_tensors(&model.device())?;
    let output = model.score(&ids, &mask)?;
    output.into_scores(readout, texts.len())
}

/// Score raw generations with the train reward model.
///
/// `prompts[i]` is the expanded prompt `raw[i]` was generated from. Returns
/// parallel scores (length-penalised), joined prompt + trimmed completion
/// texts, and trimmed completion lengths, in input order.
pub fn score_completions_train(
    model: &dyn RewardModel,
    tokenizer: &TextTokenizer,
    raw: &[String],
    prompts: &[String],
    args: &TrainingArguments,
    minibatch_size: usize,
) -> TrainResult<ScoredGroup> {
    if raw.len() != prompts.len() {
        return Err(TrainError::MalformedScoringOutput(format!(
            "{} generations for {} prompts",
            raw.len(),
            prompts.len()
        )));
    }
    let readout = if args.reward_model_is_steamshp {
        ScoreReadout::PreferenceChoice {
            token_id: args.preference_choice_token_id,
        }
    } else {
        ScoreReadout::Direct
    };
    let mut out = ScoredGroup::default();
    let size = minibatch_size.max(1);
    for (i, (chunk, chunk_prompts)) in raw.chunks(size).zip(prompts.chunks(size)).enumerate() {
        debug!("Scoring minibatch {i} ({} completions)", chunk.len());
        let prepared = chunk
            .iter()
            .zip(chunk_prompts)
            .map(|(r, p)| prepare_completion(r, p, args))
            .collect::<TrainResult<Vec<_>>>()?;
        let inputs: Vec<String> = prepared.iter().map(|p| p.reward_input.clone()).collect();
        let lengths: Vec<usize> = prepared.iter().map(|p| p.length).collect();
        let mut scores = score_texts(model, tokenizer, &inputs, args.max_length_rm, readout)?;
        apply_length_penalty(&mut scores, &lengths, args.length_penalty);
        out.scores.extend(scores);
        out.lengths.extend(lengths);
        out.completions.extend(prepared.into_iter().map(|p| p.joined));
    }
    Ok(out)
}

/// Score already-trimmed texts with the validation reward model. No length
/// penalty and no re-trimming.
pub fn score_completions_val(
    model: &dyn RewardModel,
    tokenizer: &TextTokenizer,
    trimmed: &[String],
    max_length: usize,
    minibatch_size: usize,
) -> TrainResult<Vec<f32>> {
    let mut scores = Vec::with_capacity(trimmed.len());
    for chunk in trimmed.chunks(minibatch_size.max(1)) {
        scores.extend(score_texts(
            model,
            tokenizer,
            chunk,
            max_length,
            ScoreReadout::Direct,
        )?);
    }
    Ok(scores)
}

/// Validation runs every `interval`-th superbatch (when `interval > 0`) and
/// always on the last one.
pub fn should_validate(
    superbatch_index: usize,
    total_superbatches: usize,
    interval: usize,
) -> bool {
    (interval > 0 && superbatch_index % interval == 0)
        || superbatch_index + 1 == total_superbatches
}
