/// Output printed when a handler produced nothing
pub const EMPTY_OUTPUT: &str = "No output generated";

/// Makes a handler result safe for the single-line stdout contract.
///
/// Line breaks are encoded as a literal `\n`, remaining control characters
/// turn into spaces and anything outside ASCII becomes `?`.
pub fn normalize(result: &str) -> String {
    let trimmed = result.trim();
    if trimmed.is_empty() {
        return EMPTY_OUTPUT.to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\n");
            }
            '\n' => out.push_str("\\n"),
            c if c.is_ascii_control() => out.push(' '),
            c if c.is_ascii() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}
