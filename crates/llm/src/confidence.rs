use crate::message::ChatResponse;

const HEDGING_PHRASES: &[&str] = &[
    "i'm not sure",
    "i think",
    "possibly",
    "maybe",
    "perhaps",
    "probably",
    "i don't know",
    "not certain",
    "might be",
    "could be",
    "i believe",
    "unclear",
];

/// Heuristic confidence score for a local-model response.
/// Weighted sum of four sub-scores, each in [0, 1].
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn score(resp: &ChatResponse, tools_requested: bool) -> f32 {
        let content = resp.message.content.as_deref().unwrap_or("");
        let tool = score_tool(content, &resp.message.tool_calls, tools_requested);
        let length = score_length(content);
        let hedging = score_hedging(content);
        let repetition = score_repetition(content);
        0.35 * tool + 0.20 * length + 0.25 * hedging + 0.20 * repetition
    }
}

fn score_tool(content: &str, tool_calls: &[crate::message::ToolCall], tools_requested: bool) -> f32 {
    let has_content = !content.trim().is_empty();
    let has_tool_calls = !tool_calls.is_empty();

    if !tools_requested {
        return if has_content || has_tool_calls { 1.0 } else { 0.5 };
    }

    if has_tool_calls {
        let valid = tool_calls.iter().filter(|tc| tc.has_valid_arguments()).count();
        return valid as f32 / tool_calls.len() as f32;
    }

    if has_content {
        0.6
    } else {
        0.2
    }
}

fn score_length(content: &str) -> f32 {
    let words = content.split_whitespace().count();
    match words {
        0 => 0.0,
        1..=2 => 0.3,
        3..=4 => 0.6,
        5..=300 => 1.0,
        301..=500 => 0.7,
        _ => 0.5,
    }
}

fn score_hedging(content: &str) -> f32 {
    if content.is_empty() {
        return 0.5;
    }
    let lower = content.to_lowercase();
    let count = HEDGING_PHRASES.iter().filter(|p| lower.contains(**p)).count();
    match count {
        0 => 1.0,
        1 => 0.7,
        2 => 0.5,
        _ => 0.3,
    }
}

fn score_repetition(content: &str) -> f32 {
    let fragments: Vec<String> = content
        .split(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|s| s.trim().to_lowercase())
        .filter(|s| s.len() > 5)
        .collect();

    if fragments.is_empty() {
        return 1.0;
    }

    let total = fragments.len();
    let unique = fragments.iter().collect::<std::collections::HashSet<_>>().len();
    let duplicate_ratio = (total - unique) as f32 / total as f32;

    if duplicate_ratio == 0.0 {
        1.0
    } else if duplicate_ratio < 0.2 {
        0.7
    } else if duplicate_ratio < 0.5 {
        0.4
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    fn response(content: &str) -> ChatResponse {
        ChatResponse { message: ChatMessage::assistant(content), finish_reason: "stop".to_string(), usage: None }
    }

    // ── length sub-score ────────────────────────────────────────────────

    #[test]
    fn empty_content_scores_zero_length() {
        assert_eq!(score_length(""), 0.0);
    }

    #[test]
    fn sweet_spot_length_scores_one() {
        assert_eq!(score_length("one two three four five"), 1.0);
    }

    #[test]
    fn very_long_content_scores_half() {
        let long = "word ".repeat(600);
        assert_eq!(score_length(&long), 0.5);
    }

    // ── hedging sub-score ───────────────────────────────────────────────

    #[test]
    fn no_hedging_scores_one() {
        assert_eq!(score_hedging("Paris is the capital of France."), 1.0);
    }

    #[test]
    fn three_or_more_hedges_scores_low() {
        assert_eq!(score_hedging("I think, maybe, perhaps this is unclear"), 0.3);
    }

    #[test]
    fn empty_content_hedging_is_neutral() {
        assert_eq!(score_hedging(""), 0.5);
    }

    // ── repetition sub-score ────────────────────────────────────────────

    #[test]
    fn no_repeated_fragments_scores_one() {
        assert_eq!(score_repetition("First sentence here. Second sentence differs."), 1.0);
    }

    #[test]
    fn heavily_repeated_fragments_score_low() {
        let text = "this repeats exactly. this repeats exactly. this repeats exactly. something else entirely here.";
        assert_eq!(score_repetition(text), 0.1);
    }

    // ── full scorer / scenarios ──────────────────────────────────────────

    #[test]
    fn accepts_confident_answer() {
        let resp = response(
            "The capital of France is Paris, a major European city known for the Eiffel Tower.",
        );
        let score = ConfidenceScorer::score(&resp, false);
        assert!(score >= 0.7, "score was {score}");
    }

    #[test]
    fn empty_response_with_no_tools_scores_at_most_half() {
        let resp = response("");
        let score = ConfidenceScorer::score(&resp, false);
        assert!(score <= 0.5, "score was {score}");
    }

    #[test]
    fn invalid_tool_call_json_lowers_tool_subscore() {
        use crate::message::{ToolCall, ToolCallFunction};
        let mut resp = response("");
        resp.message.tool_calls = vec![ToolCall {
            id: "1".into(),
            function: ToolCallFunction { name: "lookup".into(), arguments: "{not json".into() },
        }];
        assert_eq!(score_tool("", &resp.message.tool_calls, true), 0.0);
    }
}
