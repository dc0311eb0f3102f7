//! Python string-literal quoting for REPL `f.write(...)` commands.

/// Renders `s` as a double-quoted Python string literal.
///
/// Escapes the backslash, the quote, and control characters, so any line
/// of file content survives the trip through the device's line-oriented
/// input untouched.
pub fn python_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
