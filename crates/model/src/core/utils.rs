use std::fmt::Write;

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn quote_identifier(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('`');
    for ch in ident.chars() {
        if ch == '`' {
            out.push('`');
        }
        out.push(ch);
    }
    out.push('`');
    out
}

/// Quote a string literal using MySQL escaping rules.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Render arbitrary bytes as a SQL literal: a quoted string when the bytes are
/// valid UTF-8, a hex literal otherwise.
pub fn bytes_literal(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => quote_string(s),
        Err(_) => hex_literal(bytes),
    }
}

pub fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(3 + 2 * bytes.len());
    out.push_str("X'");
    for b in bytes {
        let _ = write!(&mut out, "{:02X}", b);
    }
    out.push('\'');
    out
}

/// Percent-encode a name so it is safe as a single path component on every
/// supported storage backend.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            let _ = write!(&mut out, "%{:02X}", b);
        }
    }
    out
}

/// Inverse of [`encode_name`]. Returns `None` on malformed escapes.
pub fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers_and_strings() {
        assert_eq!(quote_identifier("a`b"), "`a``b`");
        assert_eq!(quote_string("it's\\"), "'it\\'s\\\\'");
    }

    #[test]
    fn binary_values_become_hex() {
        assert_eq!(bytes_literal(&[0xff, 0x00]), "X'FF00'");
        assert_eq!(bytes_literal(b"abc"), "'abc'");
    }

    #[test]
    fn name_encoding_reverses() {
        let name = "my db@1.x";
        let enc = encode_name(name);
        assert_eq!(enc, "my%20db%401%2Ex");
        assert_eq!(decode_name(&enc).as_deref(), Some(name));
    }
}
