use crate::config::ThinkTagsMode;
use regex::Regex;
use std::sync::LazyLock;

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<summary>.*?</summary>").expect("summary pattern"));
static DETAILS_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<details[^>]*>").expect("details pattern"));

const RESIDUAL_TAGS: [&str; 3] = ["</thinking>", "<Full>", "</Full>"];

/// Rewrites one fragment of the upstream thinking channel for presentation.
///
/// The rewrite pass is repeated until the text stops changing. Every step
/// only ever removes or shortens text, so the loop terminates, and the
/// result is a fixed point: applying the function again is a no-op.
pub fn transform_thinking(raw: &str, mode: ThinkTagsMode) -> String {
    let mut current = rewrite_once(raw, mode);
    loop {
        let next = rewrite_once(&current, mode);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn rewrite_once(raw: &str, mode: ThinkTagsMode) -> String {
    let mut s = SUMMARY_RE.replace_all(raw, "").into_owned();
    for tag in RESIDUAL_TAGS {
        s = s.replace(tag, "");
    }
    let s = s.trim();

    let s = match mode {
        ThinkTagsMode::Think => DETAILS_OPEN_RE
            .replace_all(s, "<think>")
            .replace("</details>", "</think>"),
        ThinkTagsMode::Strip => DETAILS_OPEN_RE
            .replace_all(s, "")
            .replace("</details>", ""),
        ThinkTagsMode::Raw => s.to_string(),
    };

    let s = s.strip_prefix("> ").unwrap_or(&s);
    s.replace("\n> ", "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [ThinkTagsMode; 3] = [
        ThinkTagsMode::Strip,
        ThinkTagsMode::Think,
        ThinkTagsMode::Raw,
    ];

    #[test]
    fn strips_summary_spanning_lines() {
        let out = transform_thinking(
            "<summary>Thinking\n...</summary>actual",
            ThinkTagsMode::Strip,
        );
        assert_eq!(out, "actual");
    }

    #[test]
    fn strip_mode_removes_details_markers() {
        let raw = "<details type=\"reasoning\" done=\"false\">\n> step one\n> step two</details>";
        assert_eq!(
            transform_thinking(raw, ThinkTagsMode::Strip),
            "step one\nstep two"
        );
    }

    #[test]
    fn think_mode_rewrites_details_to_think() {
        let raw = "<details open>reasoning</details>";
        assert_eq!(
            transform_thinking(raw, ThinkTagsMode::Think),
            "<think>reasoning</think>"
        );
    }

    #[test]
    fn raw_mode_keeps_details_markers() {
        let raw = "<details open>reasoning</details>";
        assert_eq!(transform_thinking(raw, ThinkTagsMode::Raw), raw);
    }

    #[test]
    fn residual_tags_are_removed() {
        assert_eq!(
            transform_thinking("<Full>abc</Full></thinking>", ThinkTagsMode::Strip),
            "abc"
        );
    }

    #[test]
    fn whitespace_only_fragment_becomes_empty() {
        assert_eq!(transform_thinking("  \n ", ThinkTagsMode::Strip), "");
        assert_eq!(transform_thinking("<summary>x</summary>", ThinkTagsMode::Think), "");
    }

    #[test]
    fn clean_text_is_unchanged() {
        for mode in MODES {
            assert_eq!(transform_thinking("plain answer", mode), "plain answer");
        }
    }

    #[test]
    fn idempotent_for_adversarial_inputs() {
        let inputs = [
            "> > nested quote",
            "<sum<summary>x</summary>mary>hidden</summary>tail",
            "</thin</Full>king>text",
            "<det<details>ails open>x</deta</details>ils>",
            "\n> \n> a\n> > b",
            "   <details>  > q </details>  ",
            "",
            "<Full><Full></Full>",
        ];
        for mode in MODES {
            for input in inputs {
                let once = transform_thinking(input, mode);
                let twice = transform_thinking(&once, mode);
                assert_eq!(once, twice, "mode {mode:?} input {input:?}");
            }
        }
    }
}
