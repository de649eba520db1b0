//! Identifier helpers for the emitters.

/// `wl_foo_bar` → `WlFooBar`; entries starting with a digit get a
/// leading underscore so they stay valid identifiers.
pub fn snake_to_camel(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for part in input.split('_') {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// `wl_foo_bar` → `WL_FOO_BAR`.
pub fn to_screaming_snake(input: &str) -> String {
    input.to_ascii_uppercase()
}
