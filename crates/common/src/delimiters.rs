//! Conversation turn boundaries.
//!
//! Completions sampled from a chat model often run on into hallucinated
//! extra turns. Three boundary policies of increasing strictness decide
//! where a completion ends:
//!
//! * [`BoundaryPolicy::Simple`]: only the canonical `\n\nHuman:` / `\n\nAssistant:` markers.
//! * [`BoundaryPolicy::Medium`]: any newline run followed by a speaker tag (`Human`, `Assistant`, `H`, `A`). Used when trimming before scoring.
//! * [`BoundaryPolicy::Complex`]: case-insensitive speaker tags anywhere, single-letter tags after newlines, and blank-line runs. Used for display.

use std::sync::LazyLock;

use regex::Regex;

/// Marks the start of the model's turn. The prompt ends with it.
pub const PROMPT_DELIMITER: &str = "\n\nAssistant:";
/// Marks the start of a user turn.
pub const HUMAN_DELIMITER: &str = "\n\nHuman:";

static SIMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n\n(?:Human|Assistant):").unwrap_or_else(|e| panic!("simple boundary regex: {e}"))
});

static MEDIUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n+(?:Human|Assistant|H|A)\s*:")
        .unwrap_or_else(|e| panic!("medium boundary regex: {e}"))
});

static COMPLEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\n+\s*|\b)(?:human|assistant|user)\s*:|\n+\s*(?:h|a)\s*:|\n{3,}")
        .unwrap_or_else(|e| panic!("complex boundary regex: {e}"))
});

/// Named turn-boundary detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryPolicy {
    Simple,
    Medium,
    Complex,
}

impl BoundaryPolicy {
    pub fn regex(self) -> &'static Regex {
        match self {
            BoundaryPolicy::Simple => &SIMPLE,
            BoundaryPolicy::Medium => &MEDIUM,
            BoundaryPolicy::Complex => &COMPLEX,
        }
    }

    /// Byte offset of the first boundary in `text`, if any.
    pub fn find(self, text: &str) -> Option<usize> {
        self.regex().find(text).map(|m| m.start())
    }
}

/// Split a generated text into `(prompt, completion)` at the last occurrence
/// of `delimiter`. The prompt keeps the delimiter. Without a delimiter the
/// prompt is empty and the whole text is the completion.
pub fn separate_prompt_from_completion<'a>(text: &'a str, delimiter: &str) -> (&'a str, &'a str) {
    match text.rfind(delimiter) {
        Some(pos) => text.split_at(pos + delimiter.len()),
        None => ("", text),
    }
}

/// Split a generated text into `(prompt, completion)` right after the prompt
/// that produced it.
///
/// When `text` starts with `prompt` verbatim the split is at the prompt's
/// end. Otherwise (decoding may normalise whitespace) the prompt's own
/// `delimiter` occurrences are counted and the split lands after the same
/// occurrence in `text`. Either way, turns the model invented after its first
/// answer stay in the completion, where a boundary trim can cut them.
pub fn split_after_prompt<'a>(text: &'a str, prompt: &str, delimiter: &str) -> (&'a str, &'a str) {
    if !prompt.is_empty() && text.starts_with(prompt) {
        return text.split_at(prompt.len());
    }
    let turns = prompt.matches(delimiter).count().max(1);
    match text.match_indices(delimiter).nth(turns - 1) {
        Some((pos, _)) => text.split_at(pos + delimiter.len()),
        None => ("", text),
    }
}

/// Cut `completion` at its first turn boundary and strip surrounding
/// whitespace. Applying it twice gives the same string as applying it once.
pub fn trim_completion(completion: &str, policy: BoundaryPolicy) -> String {
    let end = policy.find(completion).unwrap_or(completion.len());
    completion[..end].trim().to_string()
}

/// Keep only the first human/assistant exchange of a generated conversation.
pub fn truncate_to_first_exchange(text: &str) -> String {
    let first_human = keep_first_two(text, HUMAN_DELIMITER);
    keep_first_two(&first_human, PROMPT_DELIMITER)
}

fn keep_first_two(text: &str, delimiter: &str) -> String {
    text.split(delimiter)
        .take(2)
        .collect::<Vec<_>>()
        .join(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_splits_at_last_delimiter() {
        let text = "\n\nHuman: hi\n\nAssistant: hello\n\nHuman: again\n\nAssistant: sure";
        let (prompt, completion) = separate_prompt_from_completion(text, PROMPT_DELIMITER);
        assert!(prompt.ends_with(PROMPT_DELIMITER));
        assert!(prompt.contains("again"));
        assert_eq!(completion, " sure");
    }

    #[test]
    fn separate_without_delimiter_has_empty_prompt() {
        let (prompt, completion) = separate_prompt_from_completion("just text", PROMPT_DELIMITER);
        assert_eq!(prompt, "");
        assert_eq!(completion, "just text");
    }

    #[test]
    fn split_after_prompt_keeps_invented_turns_in_completion() {
        let prompt = "\n\nHuman: q\n\nAssistant:";
        let text = "\n\nHuman: q\n\nAssistant: answer\n\nHuman: foo\n\nAssistant: bar";
        let (p, c) = split_after_prompt(text, prompt, PROMPT_DELIMITER);
        assert_eq!(p, prompt);
        assert_eq!(c, " answer\n\nHuman: foo\n\nAssistant: bar");
    }

    #[test]
    fn split_after_prompt_counts_turns_when_prefix_differs() {
        // Multi-turn prompt whose decoded form lost a space.
        let prompt = "SYS \n\nHuman: a\n\nAssistant: b\n\nHuman: c\n\nAssistant:";
        let text = "SYS\n\nHuman: a\n\nAssistant: b\n\nHuman: c\n\nAssistant: d\n\nAssistant: e";
        let (p, c) = split_after_prompt(text, prompt, PROMPT_DELIMITER);
        assert!(p.ends_with("c\n\nAssistant:"));
        assert_eq!(c, " d\n\nAssistant: e");
    }

    #[test]
    fn split_after_prompt_without_delimiter() {
        assert_eq!(
            split_after_prompt("free text", "other", PROMPT_DELIMITER),
            ("", "free text")
        );
    }

    #[test]
    fn medium_trim_cuts_hallucinated_turn() {
        let c = " The capital is Paris.\nH: thanks\nA: welcome";
        assert_eq!(trim_completion(c, BoundaryPolicy::Medium), "The capital is Paris.");
    }

    #[test]
    fn simple_ignores_short_tags() {
        let c = " Paris.\nH: thanks";
        assert_eq!(trim_completion(c, BoundaryPolicy::Simple), "Paris.\nH: thanks");
        let c = " Paris.\n\nHuman: thanks";
        assert_eq!(trim_completion(c, BoundaryPolicy::Simple), "Paris.");
    }

    #[test]
    fn complex_catches_blank_lines_and_lowercase() {
        assert_eq!(trim_completion("one\n\n\ntwo", BoundaryPolicy::Complex), "one");
        assert_eq!(trim_completion("ok then user: more", BoundaryPolicy::Complex), "ok then");
    }

    #[test]
    fn trim_is_idempotent() {
        let samples = [
            " Sure.\n\nHuman: and?\n\nAssistant: more",
            "plain answer",
            "\n\nHuman: starts with boundary",
            "  spaced  \nA: x",
            "",
        ];
        for policy in [BoundaryPolicy::Simple, BoundaryPolicy::Medium, BoundaryPolicy::Complex] {
            for s in samples {
                let once = trim_completion(s, policy);
                assert_eq!(trim_completion(&once, policy), once, "{policy:?} on {s:?}");
            }
        }
    }

    #[test]
    fn first_exchange_drops_later_turns() {
        let text = "\n\nHuman: q1\n\nAssistant: a1\n\nHuman: q2\n\nAssistant: a2";
        assert_eq!(truncate_to_first_exchange(text), "\n\nHuman: q1\n\nAssistant: a1");
    }
}
