//! Prompt source: loading and preparing the prompt pool.
//!
//! Supports JSONL (`{"prompt": ...}` or `{"text": ...}` per line), a JSON
//! array of strings, or plain text with one prompt per line (literal `\n`
//! escapes are expanded).

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::config::DataConfig;

/// Load every prompt from `path`, in file order.
pub fn load_prompts(path: &Path) -> AnyhowResult<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read prompts from {}", path.display()))?;
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let prompts: Vec<String> = serde_json::from_str(trimmed)
            .with_context(|| format!("parse JSON prompt array in {}", path.display()))?;
        return Ok(prompts);
    }
    let prompts = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(extract_prompt)
        .collect();
    Ok(prompts)
}

fn extract_prompt(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v
                .get("prompt")
                .or_else(|| v.get("text"))
                .and_then(|t| t.as_str())
            {
                return t.to_string();
            }
        }
    }
    line.replace("\\n", "\n")
}

/// De-duplicate, drop over-long prompts, shuffle, and cap the pool size.
pub fn prepare_prompts(prompts: Vec<String>, config: &DataConfig) -> Vec<String> {
    let before = prompts.len();
    let mut seen = HashSet::new();
    let mut prompts: Vec<String> = prompts
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect();
    let unique = prompts.len();

    if config.max_prompt_char_length > 0 {
        prompts.retain(|p| p.chars().count() < config.max_prompt_char_length);
    }
    info!(
        "Prepared prompts: {before} loaded, {} duplicates, {} too long",
        before - unique,
        unique - prompts.len()
    );

    let mut rng = rand::rngs::StdRng::seed_from_u64(config.shuffle_seed);
    prompts.shuffle(&mut rng);
    if config.num_prompts > 0 {
        prompts.truncate(config.num_prompts);
    }
    prompts
}
