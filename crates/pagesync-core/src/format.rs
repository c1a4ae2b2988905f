use crate::blocks::{plain_text, BlockKind, TextRun};
use std::ops::Range;

/// One block recovered from buffer lines. `lines` is relative to the parsed slice.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedBlock {
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
    pub lines: Range<usize>,
}

/// Text <-> block boundary. Implementations must be pure and total: every input
/// produces some output, and `parse(format(x))` gives back `x`'s kind and text.
pub trait Formatter: Send + Sync {
    fn format(&self, kind: &BlockKind, content: &[TextRun]) -> Vec<String>;
    fn parse(&self, lines: &[String]) -> Vec<ParsedBlock>;
}

const CONTINUATION: &str = "  ";
const TOGGLE_PREFIX: &str = "▸ ";
const CALLOUT_PREFIX: &str = "!> ";
const FENCE: &str = "```";
const ESCAPE: char = '\\';

/// Markdown-flavoured rendering with one block per line. Multi-line text continues
/// on lines indented by two spaces; code blocks use fences. Text that would read
/// back as another block type is written with a leading backslash after the prefix.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineFormatter;

impl Formatter for LineFormatter {
    fn format(&self, kind: &BlockKind, content: &[TextRun]) -> Vec<String> {
        let text = plain_text(content);
        match kind {
            BlockKind::Code { language } => {
                let mut lines = vec![format!("{FENCE}{}", language.as_deref().unwrap_or(""))];
                if !text.is_empty() {
                    lines.extend(text.split('\n').map(str::to_string));
                }
                lines.push(FENCE.to_string());
                lines
            }
            BlockKind::Divider => vec!["---".to_string()],
            BlockKind::Unsupported { type_name } => vec![format!("[{type_name}]")],
            _ => {
                let prefix = line_prefix(kind);
                let mut parts = text.split('\n');
                let first = parts.next().unwrap_or_default();
                let line = if needs_escape(kind, &prefix, first) {
                    format!("{prefix}{ESCAPE}{first}")
                } else {
                    format!("{prefix}{first}")
                };
                let mut lines = vec![line];
                lines.extend(parts.map(|part| format!("{CONTINUATION}{part}")));
                lines
            }
        }
    }

    fn parse(&self, lines: &[String]) -> Vec<ParsedBlock> {
        let mut blocks = Vec::new();
        let mut ix = 0;
        while ix < lines.len() {
            let line = lines[ix].as_str();
            if let Some(language) = line.strip_prefix(FENCE) {
                let start = ix;
                let mut body = Vec::new();
                ix += 1;
                while ix < lines.len() && lines[ix].trim_end() != FENCE {
                    body.push(lines[ix].as_str());
                    ix += 1;
                }
                ix = (ix + 1).min(lines.len());
                let language = language.trim();
                blocks.push(ParsedBlock {
                    kind: BlockKind::Code {
                        language: (!language.is_empty()).then(|| language.to_string()),
                    },
                    content: runs(body.join("\n")),
                    lines: start..ix,
                });
                continue;
            }

            let start = ix;
            let (kind, first) = classify(line);
            let mut text = first.strip_prefix(ESCAPE).unwrap_or(first).to_string();
            ix += 1;
            if kind.has_rich_text() {
                while ix < lines.len() {
                    let Some(rest) = lines[ix].strip_prefix(CONTINUATION) else {
                        break;
                    };
                    text.push('\n');
                    text.push_str(rest);
                    ix += 1;
                }
            }
            blocks.push(ParsedBlock {
                kind,
                content: runs(text),
                lines: start..ix,
            });
        }
        blocks
    }
}

fn runs(text: String) -> Vec<TextRun> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![TextRun::plain(text)]
    }
}

fn needs_escape(kind: &BlockKind, prefix: &str, first: &str) -> bool {
    if first.starts_with(ESCAPE) {
        return true;
    }
    let line = format!("{prefix}{first}");
    if line.starts_with(FENCE) {
        return true;
    }
    let (parsed, rest) = classify(&line);
    !parsed.same_semantic_type(kind) || rest != first
}

fn line_prefix(kind: &BlockKind) -> String {
    match kind {
        BlockKind::Heading { level, toggleable } => {
            let hashes = "#".repeat(usize::from((*level).clamp(1, 3)));
            if *toggleable {
                format!("{TOGGLE_PREFIX}{hashes} ")
            } else {
                format!("{hashes} ")
            }
        }
        BlockKind::Quote => "> ".to_string(),
        BlockKind::BulletedListItem => "- ".to_string(),
        BlockKind::NumberedListItem => "1. ".to_string(),
        BlockKind::ToDo { checked: true } => "- [x] ".to_string(),
        BlockKind::ToDo { checked: false } => "- [ ] ".to_string(),
        BlockKind::Toggle => TOGGLE_PREFIX.to_string(),
        BlockKind::Callout { .. } => CALLOUT_PREFIX.to_string(),
        BlockKind::Paragraph
        | BlockKind::Code { .. }
        | BlockKind::Divider
        | BlockKind::Unsupported { .. } => String::new(),
    }
}

fn classify(line: &str) -> (BlockKind, &str) {
    if line.trim_end() == "---" {
        return (BlockKind::Divider, "");
    }
    if let Some(rest) = line.strip_prefix(TOGGLE_PREFIX) {
        if let Some((level, text)) = heading(rest) {
            return (
                BlockKind::Heading {
                    level,
                    toggleable: true,
                },
                text,
            );
        }
        return (BlockKind::Toggle, rest);
    }
    if let Some((level, text)) = heading(line) {
        return (BlockKind::heading(level), text);
    }
    for (prefix, checked) in [("- [ ] ", false), ("- [x] ", true), ("- [X] ", true)] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return (BlockKind::ToDo { checked }, rest);
        }
    }
    if let Some(rest) = line.strip_prefix("- ") {
        return (BlockKind::BulletedListItem, rest);
    }
    if let Some(rest) = numbered(line) {
        return (BlockKind::NumberedListItem, rest);
    }
    if let Some(rest) = line.strip_prefix(CALLOUT_PREFIX) {
        return (BlockKind::Callout { icon: None }, rest);
    }
    if let Some(rest) = line.strip_prefix("> ") {
        return (BlockKind::Quote, rest);
    }
    (BlockKind::Paragraph, line)
}

fn heading(line: &str) -> Option<(u8, &str)> {
    for (prefix, level) in [("### ", 3), ("## ", 2), ("# ", 1)] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return Some((level, rest));
        }
    }
    None
}

fn numbered(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix(". ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_one_block_per_line() {
        let parsed = LineFormatter.parse(&lines(&[
            "# Title",
            "plain",
            "- [x] done",
            "- bullet",
            "12. numbered",
            "> quote",
            "---",
            "",
        ]));
        let kinds: Vec<_> = parsed.iter().map(|block| block.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::heading(1),
                BlockKind::Paragraph,
                BlockKind::ToDo { checked: true },
                BlockKind::BulletedListItem,
                BlockKind::NumberedListItem,
                BlockKind::Quote,
                BlockKind::Divider,
                BlockKind::Paragraph,
            ]
        );
        assert_eq!(parsed[0].content, vec![TextRun::plain("Title")]);
        assert!(parsed[7].content.is_empty());
        assert_eq!(parsed[4].lines, 4..5);
    }

    #[test]
    fn code_fence_spans_lines() {
        let parsed = LineFormatter.parse(&lines(&["```rust", "fn a() {}", "", "```", "after"]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0].kind,
            BlockKind::Code {
                language: Some("rust".to_string())
            }
        );
        assert_eq!(plain_text(&parsed[0].content), "fn a() {}\n");
        assert_eq!(parsed[0].lines, 0..4);
        assert_eq!(parsed[1].lines, 4..5);
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let parsed = LineFormatter.parse(&lines(&["```", "x"]));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].lines, 0..2);
    }

    #[test]
    fn continuation_lines_join_text() {
        let parsed = LineFormatter.parse(&lines(&["- first", "  second", "next"]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(plain_text(&parsed[0].content), "first\nsecond");
    }

    #[test]
    fn format_then_parse_keeps_kind_and_text() {
        let cases = vec![
            (
                BlockKind::Heading {
                    level: 2,
                    toggleable: true,
                },
                "Section",
            ),
            (BlockKind::Toggle, "details"),
            (BlockKind::Callout { icon: None }, "note"),
            (BlockKind::ToDo { checked: false }, "todo"),
            (BlockKind::Paragraph, "multi\nline"),
            (BlockKind::Code { language: None }, "a\nb"),
        ];
        for (kind, text) in cases {
            let rendered = LineFormatter.format(&kind, &[TextRun::plain(text)]);
            let parsed = LineFormatter.parse(&rendered);
            assert_eq!(parsed.len(), 1, "{rendered:?}");
            assert_eq!(parsed[0].kind, kind);
            assert_eq!(plain_text(&parsed[0].content), text);
        }
    }

    #[test]
    fn text_that_looks_like_a_prefix_survives_a_round_trip() {
        let kinds = vec![
            BlockKind::Paragraph,
            BlockKind::heading(1),
            BlockKind::heading(3),
            BlockKind::Quote,
            BlockKind::BulletedListItem,
            BlockKind::NumberedListItem,
            BlockKind::ToDo { checked: true },
            BlockKind::Toggle,
            BlockKind::Callout { icon: None },
        ];
        let texts = [
            "1. Intro",
            "---",
            "--- ",
            "# not a heading",
            "## nor this",
            "- dash",
            "- [ ] box",
            "[x] box",
            "> quoted",
            "!> callout",
            "▸ toggle",
            "```rust",
            "\\already escaped",
            "plain",
        ];
        for kind in &kinds {
            for text in texts {
                let rendered = LineFormatter.format(kind, &[TextRun::plain(text)]);
                let parsed = LineFormatter.parse(&rendered);
                assert_eq!(parsed.len(), 1, "{kind:?} {rendered:?}");
                assert_eq!(&parsed[0].kind, kind, "{rendered:?}");
                assert_eq!(plain_text(&parsed[0].content), text, "{rendered:?}");
            }
        }
    }

    #[test]
    fn plain_text_is_not_escaped() {
        let rendered = LineFormatter.format(&BlockKind::Paragraph, &[TextRun::plain("hello")]);
        assert_eq!(rendered, vec!["hello".to_string()]);
        let escaped = LineFormatter.format(&BlockKind::Paragraph, &[TextRun::plain("1. Intro")]);
        assert_eq!(escaped, vec!["\\1. Intro".to_string()]);
    }

    #[test]
    fn unsupported_blocks_render_as_placeholder() {
        let rendered = LineFormatter.format(
            &BlockKind::Unsupported {
                type_name: "child_page".to_string(),
            },
            &[],
        );
        assert_eq!(rendered, vec!["[child_page]".to_string()]);
    }
}
