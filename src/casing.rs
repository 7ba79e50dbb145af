use std::sync::OnceLock;

use regex::Regex;

pub fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn title_case(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn shouting_word() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\p{Lu}{3,}\b").expect("static pattern compiles"))
}

pub fn format_date(text: &str) -> String {
    shouting_word()
        .replace_all(text, |caps: &regex::Captures<'_>| title_case(&caps[0]))
        .into_owned()
}
