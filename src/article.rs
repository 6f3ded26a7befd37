use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

use crate::models::Style;

const SYSTEM_PROMPT: &str = "You are a professional content creator.";

/// A fully-constructed generation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// An article assembled from raw model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub content: String,
}

/// Human-readable name of a language code, as used in the prompt.
pub fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "ru" => "Russian",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "uk" => "Ukrainian",
        "pt" => "Portuguese",
        other => other,
    }
}

fn style_directive(style: Style) -> &'static str {
    match style {
        Style::Expert => "Write in an expert, professional tone.",
        Style::Casual => "Write in a casual, friendly tone.",
        Style::Humorous => "Write in a humorous, entertaining tone.",
    }
}

pub fn build_prompt(topic: &str, description: &str, language: &str, style: Style) -> Prompt {
    let mut user = format!("Topic: {}\n", topic.trim());
    if !description.trim().is_empty() {
        user.push_str(&format!("Description: {}\n", description.trim()));
    }
    user.push_str(&format!(
        "\nPlease write a detailed article in {}.\n{}\n\n",
        language_name(language),
        style_directive(style)
    ));
    user.push_str(
        "The content should be:\n\
         - Well-structured\n\
         - Engaging\n\
         - Informative\n\
         - Suitable for social media\n\n\
         Start with a level-1 heading containing the article title, \
         then format the text with appropriate paragraphs and sections.",
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Split raw model output into title and content. The content is kept verbatim.
pub fn assemble(topic_name: &str, raw: &str) -> Article {
    Article {
        title: extract_title(raw).unwrap_or_else(|| topic_name.to_string()),
        content: raw.to_string(),
    }
}

/// First level-1 heading, else first level-2 heading. HTML (`<h1>`) and
/// Markdown headings both count; within a level the earliest one wins.
pub fn extract_title(raw: &str) -> Option<String> {
    [(HeadingLevel::H1, "h1"), (HeadingLevel::H2, "h2")]
        .into_iter()
        .find_map(|(level, tag)| {
            let candidates = [html_heading(raw, tag), markdown_heading(raw, level)];
            candidates
                .into_iter()
                .flatten()
                .min_by_key(|(offset, _)| *offset)
                .map(|(_, title)| title)
        })
}

fn markdown_heading(raw: &str, wanted: HeadingLevel) -> Option<(usize, String)> {
    let mut current: Option<(usize, String)> = None;
    for (event, range) in Parser::new(raw).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) if level == wanted => {
                current = Some((range.start, String::new()));
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, buf)) = current.as_mut() {
                    buf.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(level)) if level == wanted => {
                if let Some((start, text)) = current.take() {
                    let text = collapse_whitespace(&text);
                    if !text.is_empty() {
                        return Some((start, text));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn html_heading(raw: &str, tag: &str) -> Option<(usize, String)> {
    // ASCII lowercasing keeps byte offsets aligned with `raw`.
    let lower = raw.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let mut search_from = 0;

    while let Some(found) = lower[search_from..].find(&open) {
        let start = search_from + found;
        let after_name = start + open.len();
        search_from = after_name;

        // Reject longer tag names such as <h1x>.
        match lower[after_name..].chars().next() {
            Some(c) if c == '>' || c.is_whitespace() => {}
            _ => continue,
        }
        let Some(gt) = lower[after_name..].find('>') else {
            break;
        };
        let content_start = after_name + gt + 1;
        let Some(end) = lower[content_start..].find(&close) else {
            break;
        };

        let text = collapse_whitespace(&strip_tags(&raw[content_start..content_start + end]));
        if !text.is_empty() {
            return Some((start, text));
        }
    }
    None
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for c in fragment.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_h1_becomes_title() {
        let article = assemble("Coffee brewing", "<h1>Coffee</h1><p>...</p>");
        assert_eq!(article.title, "Coffee");
        assert_eq!(article.content, "<h1>Coffee</h1><p>...</p>");
    }

    #[test]
    fn markdown_h1_becomes_title() {
        let raw = "Intro line\n\n# Pour-over *basics*\n\nBody\n\n# Second";
        assert_eq!(extract_title(raw).as_deref(), Some("Pour-over basics"));
    }

    #[test]
    fn h2_is_used_when_there_is_no_h1() {
        assert_eq!(
            extract_title("<p>lead</p><h2 class=\"x\">Grind <b>size</b></h2>").as_deref(),
            Some("Grind size")
        );
        assert_eq!(extract_title("text\n\n## Water temperature\n").as_deref(), Some("Water temperature"));
    }

    #[test]
    fn h1_anywhere_beats_an_earlier_h2() {
        let raw = "## Section\n\ntext\n\n# Real title";
        assert_eq!(extract_title(raw).as_deref(), Some("Real title"));
    }

    #[test]
    fn earliest_h1_wins_across_markup_styles() {
        let raw = "# Markdown first\n\n<h1>Html second</h1>";
        assert_eq!(extract_title(raw).as_deref(), Some("Markdown first"));
        let raw = "<h1>Html first</h1>\n\n# Markdown second";
        assert_eq!(extract_title(raw).as_deref(), Some("Html first"));
    }

    #[test]
    fn falls_back_to_topic_name() {
        let article = assemble("Coffee brewing", "Just a paragraph with a # in it and <h10>odd</h10>.");
        assert_eq!(article.title, "Coffee brewing");
    }

    #[test]
    fn empty_headings_are_ignored() {
        assert_eq!(extract_title("<h1> </h1>\n\n## Fallback").as_deref(), Some("Fallback"));
    }

    #[test]
    fn prompt_names_topic_language_and_style() {
        let prompt = build_prompt("Coffee brewing", "Pour-over techniques", "ru", Style::Humorous);
        assert_eq!(prompt.system, SYSTEM_PROMPT);
        assert!(prompt.user.starts_with("Topic: Coffee brewing\nDescription: Pour-over techniques\n"));
        assert!(prompt.user.contains("article in Russian."));
        assert!(prompt.user.contains("humorous"));

        let bare = build_prompt("Coffee brewing", "  ", "en", Style::Expert);
        assert!(!bare.user.contains("Description:"));
        assert!(bare.user.contains("article in English."));
    }
}
