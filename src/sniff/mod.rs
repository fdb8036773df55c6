//! Protocol sniffing module
//!
//! Best-effort extraction of the destination hostname from the first bytes
//! a client sends: SNI for TLS, the `Host` header for plain HTTP. Every
//! function here is pure and bounded by the buffer length; malformed input
//! yields "not found".
//!
//! # Example
//!
//! ```
//! use desync_tunnel::sniff::{sniff_first_chunk, Protocol};
//!
//! let data = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
//! let result = sniff_first_chunk(data, false);
//! assert_eq!(result.protocol, Protocol::Http);
//! assert_eq!(result.domain(), Some("example.com"));
//! ```

mod http;
mod result;
mod tls;

pub use http::{extract_host, looks_like_http, mix_host_case};
pub use result::{Protocol, SniffResult};
pub use tls::{extract_sni, is_client_hello, sniff_client_hello, ClientHelloInfo};

/// Classify the first chunk of a TCP flow.
///
/// HTTPS flows are only inspected for a `ClientHello`; plain flows only for
/// an HTTP `Host` header.
#[must_use]
pub fn sniff_first_chunk(data: &[u8], is_https: bool) -> SniffResult {
    if is_https {
        return match sniff_client_hello(data) {
            Some(info) => SniffResult {
                alpn: info.alpn,
                has_ech: info.has_ech,
                ..SniffResult::tls(info.sni)
            },
            None => SniffResult::unknown(),
        };
    }

    let host = extract_host(data);
    if host.is_some() || looks_like_http(data) {
        SniffResult::http(host)
    } else {
        SniffResult::unknown()
    }
}
