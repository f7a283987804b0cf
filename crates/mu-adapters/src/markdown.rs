//! Telegram delivery formatting: MarkdownV2 escaping with a plain-text
//! fallback whenever math notation is detected, since Telegram renders TeX
//! fragments as soup.

/// TeX macros that show up in operator-facing model output often enough to
/// warrant the plain-text downgrade.
const TEX_MACROS: &[&str] = &[
    "\\frac", "\\sum", "\\int", "\\sqrt", "\\alpha", "\\beta", "\\cdot", "\\times", "\\le",
    "\\ge", "\\neq", "\\approx",
];

/// Detect `$…$`, `$$…$$`, or TeX macros.
pub fn contains_math(text: &str) -> bool {
    if TEX_MACROS.iter().any(|m| text.contains(m)) {
        return true;
    }
    // A pair of dollar signs with something between them.
    let mut open: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch != '$' {
            continue;
        }
        match open {
            None => open = Some(i),
            Some(start) => {
                if i > start + 1 {
                    return true;
                }
                // `$$` immediately adjacent — display-math opener; any later
                // dollar closes it.
                open = Some(start);
            }
        }
    }
    false
}

/// Escape Telegram MarkdownV2 specials.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Body + parse mode for one outbound Telegram message.
pub fn prepare_body(text: &str) -> (String, Option<&'static str>) {
    if contains_math(text) {
        (text.to_string(), None)
    } else {
        (escape_markdown_v2(text), Some("MarkdownV2"))
    }
}
