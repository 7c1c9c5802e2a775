use once_cell::sync::Lazy;
use regex::Regex;

/// key: text-budget -> pause directive grammar
///
/// The only markup honoured inside user text. Anything else with angle brackets
/// is literal and gets escaped before it reaches the synthesis provider.
static PAUSE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<break\s+time="([0-9]+(?:\.[0-9]+)?)(ms|s)"\s*/>"#)
        .expect("pause directive pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Pause {
        raw: &'a str,
        amount: &'a str,
        unit: &'a str,
    },
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut parts = Vec::new();
    let mut cursor = 0;
    for captures in PAUSE_DIRECTIVE.captures_iter(text) {
        let (Some(whole), Some(amount), Some(unit)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        if whole.start() > cursor {
            parts.push(Segment::Literal(&text[cursor..whole.start()]));
        }
        parts.push(Segment::Pause {
            raw: whole.as_str(),
            amount: amount.as_str(),
            unit: unit.as_str(),
        });
        cursor = whole.end();
    }
    if cursor < text.len() {
        parts.push(Segment::Literal(&text[cursor..]));
    }
    parts
}

/// Canonicalises line endings and drops control characters other than
/// newlines and tabs.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Number of characters a request is billed for. Pause directives are free.
pub fn count_billable(text: &str) -> usize {
    segments(text)
        .into_iter()
        .map(|segment| match segment {
            Segment::Literal(literal) => literal.chars().count(),
            Segment::Pause { .. } => 0,
        })
        .sum()
}

/// Cuts `text` down to at most `max_billable` billable characters.
///
/// Pause directives are copied verbatim and never split. Once the budget is
/// spent nothing further is emitted, so a directive that follows the cut is
/// dropped. Text already within budget comes back unchanged, which makes the
/// operation idempotent.
pub fn truncate(text: &str, max_billable: usize) -> String {
    if count_billable(text) <= max_billable {
        return text.to_string();
    }

    let mut remaining = max_billable;
    let mut out = String::with_capacity(text.len());
    for segment in segments(text) {
        if remaining == 0 {
            break;
        }
        match segment {
            Segment::Pause { raw, .. } => out.push_str(raw),
            Segment::Literal(literal) => {
                let length = literal.chars().count();
                if length <= remaining {
                    out.push_str(literal);
                    remaining -= length;
                } else {
                    let cut = literal
                        .char_indices()
                        .nth(remaining)
                        .map(|(index, _)| index)
                        .unwrap_or(literal.len());
                    out.push_str(&literal[..cut]);
                    remaining = 0;
                }
            }
        }
    }

    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out
}

/// Escapes literal text and re-emits only well-formed pause directives, in
/// canonical form. Malformed directives never match the grammar and are
/// therefore escaped like any other text.
pub fn sanitize_for_synthesis(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for segment in segments(text) {
        match segment {
            Segment::Literal(literal) => escape_into(&mut out, literal),
            Segment::Pause { amount, unit, .. } => {
                out.push_str("<break time=\"");
                out.push_str(amount);
                out.push_str(unit);
                out.push_str("\"/>");
            }
        }
    }
    out
}

/// Wraps sanitized text in the document element the synthesis provider expects.
pub fn to_ssml(text: &str) -> String {
    format!("<speak>{}</speak>", sanitize_for_synthesis(text))
}

fn escape_into(out: &mut String, literal: &str) {
    for c in literal.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
}
