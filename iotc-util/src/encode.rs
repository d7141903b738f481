//! Percent-encoding as expected by the hub and the provisioning service.
//!
//! Letters, digits and `_.-~` are never escaped. Every call site adds its own
//! set of characters that must be left alone, which is why this does not
//! follow any of the generic URL encoding sets.

use std::fmt::Write as _;

/// Characters left unescaped in signatures and signed resource URIs.
pub const SIGNATURE_SAFE: &str = "~()*!.'";

/// Characters left unescaped in telemetry system property names.
pub const SYSTEM_PROPERTY_SAFE: &str = "$#%/\"'";

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-' | b'~')
}

/// Percent-encode `input`, leaving unreserved characters and any ASCII
/// character in `safe` as they are.
///
/// ```
/// use iotc_util::encode::quote;
///
/// assert_eq!(quote("abc+\\0123\"?%456@def", "~()*!."), "abc%2B%5C0123%22%3F%25456%40def");
/// ```
pub fn quote(input: &str, safe: &str) -> String {
    let safe = safe.as_bytes();
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if is_unreserved(byte) || safe.contains(&byte) {
            out.push(byte as char);
        } else {
            // writing to a String cannot fail
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Percent-encode everything but unreserved characters.
pub fn quote_plain(input: &str) -> String {
    quote(input, "")
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim and invalid
/// UTF-8 is replaced.
pub fn unquote(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
