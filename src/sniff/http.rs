//! HTTP/1.x request inspection
//!
//! ## Request format
//!
//! ```text
//! Method SP Request-URI SP HTTP-Version CRLF
//! Header-Field CRLF
//! ...
//! CRLF
//! [ Message-Body ]
//! ```
//!
//! Bytes are decoded as Latin-1, so any input maps to text and the scan can
//! never fail on encoding. Lines may end in CRLF or bare LF.

use tracing::trace;

/// Quick check if data looks like an HTTP request
///
/// Checks for common HTTP method prefixes only.
#[must_use]
pub fn looks_like_http(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    // GET, POST, PUT, HEAD, DELETE, OPTIONS, PATCH, CONNECT, TRACE
    matches!(
        &data[..4],
        b"GET " | b"POST" | b"PUT " | b"HEAD" | b"DELE" | b"OPTI" | b"PATC" | b"CONN" | b"TRAC"
    )
}

/// Extract the `Host` header value.
///
/// The header name is matched case-insensitively and the value is returned
/// trimmed, port included. Scanning stops at the blank line ending the
/// header block.
#[must_use]
pub fn extract_host(data: &[u8]) -> Option<String> {
    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            let value = latin1(&line[5..]);
            let value = value.trim();
            if value.is_empty() {
                trace!("Empty Host header");
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

/// Alternate the letter case of the `Host` header value in place.
///
/// Looks for `Host:` then `host:`, skips spaces, and from there until CR/LF
/// uppercases letters at even positions and lowercases those at odd ones.
/// Returns whether a header was found.
pub fn mix_host_case(data: &mut [u8]) -> bool {
    let Some(name) = find(data, b"Host:").or_else(|| find(data, b"host:")) else {
        return false;
    };

    let mut start = name + 5;
    while data.get(start) == Some(&b' ') {
        start += 1;
    }

    for (i, byte) in data[start..]
        .iter_mut()
        .take_while(|b| **b != b'\r' && **b != b'\n')
        .enumerate()
    {
        if i % 2 == 0 {
            byte.make_ascii_uppercase();
        } else {
            byte.make_ascii_lowercase();
        }
    }
    true
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
