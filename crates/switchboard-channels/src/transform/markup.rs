//! Conversion between inline markup and formatting ranges.
//!
//! Ranges index chars of the plain text. Platforms that count in UTF-16
//! code units (Telegram entities, Signal styles) convert with the
//! `utf16_*` helpers at the edge.

use switchboard_core::content::{FormatKind, TextFormat};

/// Inline markup dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `*bold*` `_italic_` `~strike~` `` `code` `` ```` ```pre``` ````.
    WhatsApp,
    /// Slack mrkdwn: WhatsApp delimiters plus `<url|text>`, `<@U123>`, entity escapes.
    Slack,
    /// Signal styled text mode: `**bold**` `*italic*` `~strike~` `` `mono` `` `||spoiler||`.
    Signal,
}

impl Dialect {
    const fn delimiters(self) -> &'static [(&'static str, Marker)] {
        match self {
            Self::WhatsApp | Self::Slack => &[
                ("```", Marker::Pre),
                ("*", Marker::Bold),
                ("_", Marker::Italic),
                ("~", Marker::Strikethrough),
                ("`", Marker::Code),
            ],
            Self::Signal => &[
                ("**", Marker::Bold),
                ("||", Marker::Spoiler),
                ("*", Marker::Italic),
                ("~", Marker::Strikethrough),
                ("`", Marker::Code),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Bold,
    Italic,
    Strikethrough,
    Code,
    Pre,
    Spoiler,
}

impl Marker {
    const fn kind(self) -> FormatKind {
        match self {
            Self::Bold => FormatKind::Bold,
            Self::Italic => FormatKind::Italic,
            Self::Strikethrough => FormatKind::Strikethrough,
            Self::Code => FormatKind::Code,
            Self::Pre => FormatKind::Pre,
            Self::Spoiler => FormatKind::Spoiler,
        }
    }

    const fn is_literal(self) -> bool {
        matches!(self, Self::Code | Self::Pre)
    }
}

/// Strip inline markup, returning plain text and the ranges it described.
#[must_use]
pub fn parse_markup(text: &str, dialect: Dialect) -> (String, Vec<TextFormat>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    let mut formats = Vec::new();
    parse_span(&chars, dialect, &mut out, &mut formats);
    formats.sort_by_key(|f| (f.offset, std::cmp::Reverse(f.length)));
    (out.into_iter().collect(), formats)
}

fn parse_span(chars: &[char], dialect: Dialect, out: &mut Vec<char>, formats: &mut Vec<TextFormat>) {
    let mut i = 0;
    'scan: while i < chars.len() {
        if dialect == Dialect::Slack {
            if chars[i] == '&' {
                if let Some((decoded, consumed)) = slack_entity(&chars[i..]) {
                    out.push(decoded);
                    i += consumed;
                    continue;
                }
            }
            if chars[i] == '<' {
                if let Some(consumed) = slack_angle(&chars[i..], out, formats) {
                    i += consumed;
                    continue;
                }
            }
        }

        for &(delim, marker) in dialect.delimiters() {
            let delim: Vec<char> = delim.chars().collect();
            if !opens_at(chars, i, &delim, marker) {
                continue;
            }
            let inner_start = i + delim.len();
            let Some(close) = find_close(chars, inner_start, &delim, marker) else {
                continue;
            };
            let start = out.len();
            if marker.is_literal() {
                out.extend_from_slice(&chars[inner_start..close]);
            } else {
                parse_span(&chars[inner_start..close], dialect, out, formats);
            }
            let length = out.len() - start;
            if length > 0 {
                formats.push(TextFormat::new(marker.kind(), start, length));
            }
            i = close + delim.len();
            continue 'scan;
        }

        out.push(chars[i]);
        i += 1;
    }
}

fn matches_at(chars: &[char], i: usize, delim: &[char]) -> bool {
    chars.get(i..i + delim.len()) == Some(delim)
}

fn opens_at(chars: &[char], i: usize, delim: &[char], marker: Marker) -> bool {
    if !matches_at(chars, i, delim) {
        return false;
    }
    if marker == Marker::Pre {
        return true;
    }
    let before_ok = i == 0 || !chars[i - 1].is_alphanumeric();
    let after_ok = chars
        .get(i + delim.len())
        .is_some_and(|c| !c.is_whitespace());
    before_ok && after_ok
}

fn find_close(chars: &[char], from: usize, delim: &[char], marker: Marker) -> Option<usize> {
    let mut k = from + 1;
    while k + delim.len() <= chars.len() {
        if marker != Marker::Pre && chars[k - 1] == '\n' {
            return None;
        }
        if matches_at(chars, k, delim) {
            if chars.get(k + delim.len()) == Some(&delim[0]) {
                k += 1;
                continue;
            }
            let closes = marker == Marker::Pre
                || (!chars[k - 1].is_whitespace()
                    && chars
                        .get(k + delim.len())
                        .is_none_or(|c| !c.is_alphanumeric()));
            if closes {
                return Some(k);
            }
        }
        k += 1;
    }
    None
}

fn slack_entity(chars: &[char]) -> Option<(char, usize)> {
    for (entity, decoded) in [("&amp;", '&'), ("&lt;", '<'), ("&gt;", '>')] {
        let entity: Vec<char> = entity.chars().collect();
        if matches_at(chars, 0, &entity) {
            return Some((decoded, entity.len()));
        }
    }
    None
}

/// `<@U123>`, `<@U123|name>`, `<#C123|general>`, `<!here>`, `<https://x|label>`.
fn slack_angle(chars: &[char], out: &mut Vec<char>, formats: &mut Vec<TextFormat>) -> Option<usize> {
    let close = chars.iter().position(|&c| c == '>' || c == '\n')?;
    if chars[close] != '>' || close < 2 {
        return None;
    }
    let inner: String = chars[1..close].iter().collect();
    let (target, label) = match inner.split_once('|') {
        Some((t, l)) => (t.to_string(), Some(l.to_string())),
        None => (inner.clone(), None),
    };

    let start = out.len();
    if let Some(user_id) = target.strip_prefix('@') {
        let display = label.map_or_else(|| format!("@{user_id}"), |l| format!("@{l}"));
        out.extend(display.chars());
        formats.push(TextFormat::new(
            FormatKind::Mention {
                user_id: user_id.to_string(),
            },
            start,
            out.len() - start,
        ));
    } else if let Some(channel) = target.strip_prefix('#') {
        let display = label.unwrap_or_else(|| channel.to_string());
        out.push('#');
        out.extend(display.chars());
    } else if let Some(special) = target.strip_prefix('!') {
        let display = label.unwrap_or_else(|| special.to_string());
        out.push('@');
        out.extend(display.chars());
    } else if target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("mailto:")
    {
        let display = label.unwrap_or_else(|| target.clone());
        out.extend(display.chars());
        formats.push(TextFormat::new(
            FormatKind::Link { url: target },
            start,
            out.len() - start,
        ));
    } else {
        return None;
    }
    Some(close + 1)
}

/// Re-encode plain text and ranges into inline markup.
///
/// Nested ranges render as nested markers. Ranges that overlap without
/// nesting cannot be expressed in inline markup; the later one is clipped
/// to its enclosing range.
#[must_use]
pub fn render_markup(text: &str, formatting: &[TextFormat], dialect: Dialect) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut ranges: Vec<&TextFormat> = formatting
        .iter()
        .filter(|f| f.length > 0 && f.end() <= chars.len())
        .collect();
    ranges.sort_by_key(|f| (f.offset, std::cmp::Reverse(f.length)));

    let mut out = String::with_capacity(text.len() + ranges.len() * 4);
    let mut open: Vec<(usize, &TextFormat)> = Vec::new();
    let mut next = 0;
    let mut pos = 0;
    'walk: while pos <= chars.len() {
        while let Some(&(end, format)) = open.last() {
            if end > pos {
                break;
            }
            out.push_str(&close_marker(&format.kind, dialect, &chars, format));
            open.pop();
        }

        while next < ranges.len() && ranges[next].offset == pos {
            let format = ranges[next];
            next += 1;
            let limit = open.last().map_or(chars.len(), |&(end, _)| end);
            let end = format.end().min(limit);
            if end <= pos {
                continue;
            }
            if let (FormatKind::Mention { user_id }, Dialect::Slack) = (&format.kind, dialect) {
                out.push_str(&format!("<@{user_id}>"));
                while next < ranges.len() && ranges[next].offset < end {
                    next += 1;
                }
                pos = end;
                continue 'walk;
            }
            out.push_str(&open_marker(&format.kind, dialect));
            open.push((end, format));
        }

        if pos < chars.len() {
            push_char(&mut out, chars[pos], dialect);
        }
        pos += 1;
    }
    out
}

fn push_char(out: &mut String, c: char, dialect: Dialect) {
    match (dialect, c) {
        (Dialect::Slack, '&') => out.push_str("&amp;"),
        (Dialect::Slack, '<') => out.push_str("&lt;"),
        (Dialect::Slack, '>') => out.push_str("&gt;"),
        _ => out.push(c),
    }
}

fn open_marker(kind: &FormatKind, dialect: Dialect) -> String {
    match (kind, dialect) {
        (FormatKind::Link { url }, Dialect::Slack) => format!("<{url}|"),
        (FormatKind::Link { .. } | FormatKind::Mention { .. }, _) => String::new(),
        (FormatKind::Spoiler, Dialect::WhatsApp | Dialect::Slack) => String::new(),
        (FormatKind::Pre, Dialect::Signal) => "`".to_string(),
        (kind, dialect) => plain_marker(kind, dialect).to_string(),
    }
}

fn close_marker(kind: &FormatKind, dialect: Dialect, chars: &[char], format: &TextFormat) -> String {
    match (kind, dialect) {
        (FormatKind::Link { .. }, Dialect::Slack) => ">".to_string(),
        (FormatKind::Link { url }, _) => {
            let label: String = chars[format.offset..format.end()].iter().collect();
            if label == *url {
                String::new()
            } else {
                format!(" ({url})")
            }
        }
        (FormatKind::Mention { .. }, _) => String::new(),
        (FormatKind::Spoiler, Dialect::WhatsApp | Dialect::Slack) => String::new(),
        (FormatKind::Pre, Dialect::Signal) => "`".to_string(),
        (kind, dialect) => plain_marker(kind, dialect).to_string(),
    }
}

const fn plain_marker(kind: &FormatKind, dialect: Dialect) -> &'static str {
    match (kind, dialect) {
        (FormatKind::Bold, Dialect::Signal) => "**",
        (FormatKind::Italic, Dialect::Signal) => "*",
        (FormatKind::Spoiler, Dialect::Signal) => "||",
        (FormatKind::Bold, _) => "*",
        (FormatKind::Italic, _) => "_",
        (FormatKind::Strikethrough, _) => "~",
        (FormatKind::Code, _) => "`",
        (FormatKind::Pre, _) => "```",
        _ => "",
    }
}

/// Convert a UTF-16 `(offset, length)` range to a char range.
///
/// Returns `None` if the range ends past the text.
#[must_use]
pub fn utf16_to_char_range(text: &str, offset: usize, length: usize) -> Option<(usize, usize)> {
    let end16 = offset.checked_add(length)?;
    let mut units = 0;
    let mut start_char = None;
    let mut end_char = None;
    for (index, c) in text.chars().enumerate() {
        if start_char.is_none() && units >= offset {
            start_char = Some(index);
        }
        if end_char.is_none() && units >= end16 {
            end_char = Some(index);
        }
        units += c.len_utf16();
    }
    let total_chars = text.chars().count();
    if units < end16 {
        return None;
    }
    let start = start_char.unwrap_or(total_chars);
    let end = end_char.unwrap_or(total_chars);
    Some((start, end.saturating_sub(start)))
}

/// Convert a char `(offset, length)` range to UTF-16 code units.
#[must_use]
pub fn char_to_utf16_range(text: &str, offset: usize, length: usize) -> (usize, usize) {
    let mut start16 = 0;
    let mut len16 = 0;
    for (index, c) in text.chars().enumerate() {
        if index < offset {
            start16 += c.len_utf16();
        } else if index < offset + length {
            len16 += c.len_utf16();
        } else {
            break;
        }
    }
    (start16, len16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bold(offset: usize, length: usize) -> TextFormat {
        TextFormat::new(FormatKind::Bold, offset, length)
    }

    #[test]
    fn test_whatsapp_parse() {
        let (plain, formats) = parse_markup("hello *world* and _you_", Dialect::WhatsApp);
        assert_eq!(plain, "hello world and you");
        assert_eq!(
            formats,
            vec![bold(6, 5), TextFormat::new(FormatKind::Italic, 16, 3)]
        );
    }

    #[test]
    fn test_snake_case_is_not_italic() {
        let (plain, formats) = parse_markup("use snake_case_names here", Dialect::WhatsApp);
        assert_eq!(plain, "use snake_case_names here");
        assert!(formats.is_empty());
    }

    #[test]
    fn test_nested_and_code() {
        let (plain, formats) = parse_markup("*bold _both_* `*raw*`", Dialect::WhatsApp);
        assert_eq!(plain, "bold both *raw*");
        assert_eq!(
            formats,
            vec![
                bold(0, 9),
                TextFormat::new(FormatKind::Italic, 5, 4),
                TextFormat::new(FormatKind::Code, 10, 5),
            ]
        );
    }

    #[test]
    fn test_pre_spans_lines() {
        let (plain, formats) = parse_markup("```let x = 1;\nlet y = 2;```", Dialect::WhatsApp);
        assert_eq!(plain, "let x = 1;\nlet y = 2;");
        assert_eq!(formats, vec![TextFormat::new(FormatKind::Pre, 0, 21)]);
    }

    #[test]
    fn test_unclosed_delimiter_is_literal() {
        let (plain, formats) = parse_markup("2 * 3 = 6 and *oops", Dialect::WhatsApp);
        assert_eq!(plain, "2 * 3 = 6 and *oops");
        assert!(formats.is_empty());
    }

    #[test]
    fn test_slack_links_mentions_entities() {
        let (plain, formats) = parse_markup(
            "hi <@U123> see <https://example.com|docs> &amp; <#C1|general>",
            Dialect::Slack,
        );
        assert_eq!(plain, "hi @U123 see docs & #general");
        assert_eq!(
            formats,
            vec![
                TextFormat::new(
                    FormatKind::Mention {
                        user_id: "U123".to_string()
                    },
                    3,
                    5
                ),
                TextFormat::new(
                    FormatKind::Link {
                        url: "https://example.com".to_string()
                    },
                    13,
                    4
                ),
            ]
        );
    }

    #[test]
    fn test_render_round_trips() {
        for dialect in [Dialect::WhatsApp, Dialect::Slack, Dialect::Signal] {
            let formats = vec![
                bold(0, 9),
                TextFormat::new(FormatKind::Italic, 5, 4),
                TextFormat::new(FormatKind::Strikethrough, 10, 3),
                TextFormat::new(FormatKind::Code, 14, 4),
            ];
            let plain = "bold both del code";
            let rendered = render_markup(plain, &formats, dialect);
            let (back, parsed) = parse_markup(&rendered, dialect);
            assert_eq!(back, plain, "{dialect:?}: {rendered}");
            assert_eq!(parsed, formats, "{dialect:?}: {rendered}");
        }
    }

    #[test]
    fn test_render_dialect_markers() {
        let formats = vec![
            bold(0, 1),
            TextFormat::new(FormatKind::Italic, 2, 1),
            TextFormat::new(FormatKind::Spoiler, 4, 1),
        ];
        assert_eq!(render_markup("a b c", &formats, Dialect::WhatsApp), "*a* _b_ c");
        assert_eq!(render_markup("a b c", &formats, Dialect::Signal), "**a** *b* ||c||");
    }

    #[test]
    fn test_render_slack_link_and_mention() {
        let formats = vec![
            TextFormat::new(
                FormatKind::Mention {
                    user_id: "U9".to_string(),
                },
                0,
                4,
            ),
            TextFormat::new(
                FormatKind::Link {
                    url: "https://x.io".to_string(),
                },
                9,
                4,
            ),
        ];
        assert_eq!(
            render_markup("@bob see docs <3", &formats, Dialect::Slack),
            "<@U9> see <https://x.io|docs> &lt;3"
        );
        assert_eq!(
            render_markup("@bob see docs", &formats, Dialect::WhatsApp),
            "@bob see docs (https://x.io)"
        );
    }

    #[test]
    fn test_utf16_conversion() {
        let text = "😀 hi";
        assert_eq!(utf16_to_char_range(text, 3, 2), Some((2, 2)));
        assert_eq!(char_to_utf16_range(text, 2, 2), (3, 2));
        assert_eq!(utf16_to_char_range(text, 0, 2), Some((0, 1)));
        assert_eq!(utf16_to_char_range(text, 3, 10), None);
    }
}
