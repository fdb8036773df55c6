//! TLS `ClientHello` inspection
//!
//! ## Layout walked by the parser
//!
//! ```text
//! offset 0   ContentType (1) = 0x16
//!        1   ProtocolVersion (2)
//!        3   Length (2)
//!        5   HandshakeType (1) = 0x01
//!        6   Length (3)
//!        9   ClientVersion (2)
//!       11   Random (32)
//!       43   SessionID (1 byte length + variable)
//!            CipherSuites (2 byte length + variable)
//!            CompressionMethods (1 byte length + variable)
//!            Extensions (2 byte length + variable)
//! ```
//!
//! The first chunk of a flow may hold only part of the handshake, so the
//! extension walk stops at whichever comes first: the declared end of the
//! extensions block or the end of the buffer.

use tracing::trace;

/// TLS `ContentType` for Handshake
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS `HandshakeType` for `ClientHello`
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Offset of the session ID length byte
const SESSION_ID_OFFSET: usize = 43;

/// SNI extension type
const TLS_EXTENSION_TYPE_SNI: u16 = 0x0000;

/// ALPN extension type
const TLS_EXTENSION_TYPE_ALPN: u16 = 0x0010;

/// ECH extension type (draft-ietf-tls-esni-18)
const TLS_EXTENSION_TYPE_ECH: u16 = 0xfe0d;

/// ECH extension type (older draft-ietf-tls-esni-13)
const TLS_EXTENSION_TYPE_ECH_DRAFT: u16 = 0xfe0a;

/// SNI name type for hostname
const TLS_SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// Details pulled out of a `ClientHello`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Record layer version (0x0301 for most modern clients)
    pub record_version: u16,
    /// `server_name` host entry
    pub sni: Option<String>,
    /// ALPN protocol list
    pub alpn: Vec<String>,
    /// Encrypted Client Hello present; `sni` is then the outer/cover name
    pub has_ech: bool,
}

/// Heuristic `ClientHello` check: handshake record whose first message is a
/// `ClientHello`.
#[must_use]
pub fn is_client_hello(data: &[u8]) -> bool {
    data.len() >= 6
        && data[0] == TLS_CONTENT_TYPE_HANDSHAKE
        && data[5] == TLS_HANDSHAKE_TYPE_CLIENT_HELLO
}

/// Extract the SNI hostname from a `ClientHello`.
///
/// Returns `None` for anything that is not a `ClientHello` or whose
/// structure runs out before a host name entry is found.
#[must_use]
pub fn extract_sni(data: &[u8]) -> Option<String> {
    sniff_client_hello(data).and_then(|info| info.sni)
}

/// Walk a `ClientHello` and collect SNI, ALPN and ECH presence.
#[must_use]
pub fn sniff_client_hello(data: &[u8]) -> Option<ClientHelloInfo> {
    if !is_client_hello(data) {
        return None;
    }

    let mut info = ClientHelloInfo {
        record_version: u16::from_be_bytes([data[1], data[2]]),
        ..ClientHelloInfo::default()
    };

    let Some(extensions) = locate_extensions(data) else {
        trace!("ClientHello ends before extensions");
        return Some(info);
    };

    let mut pos = 0;
    while pos + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[pos], extensions[pos + 1]]);
        let ext_len = usize::from(u16::from_be_bytes([extensions[pos + 2], extensions[pos + 3]]));
        pos += 4;

        let Some(ext_data) = extensions.get(pos..pos + ext_len) else {
            trace!("Extension 0x{:04x} exceeds buffer", ext_type);
            break;
        };

        match ext_type {
            TLS_EXTENSION_TYPE_SNI => {
                if info.sni.is_none() {
                    info.sni = parse_sni_extension(ext_data);
                }
            }
            TLS_EXTENSION_TYPE_ALPN => info.alpn = parse_alpn_extension(ext_data),
            TLS_EXTENSION_TYPE_ECH | TLS_EXTENSION_TYPE_ECH_DRAFT => info.has_ech = true,
            _ => {}
        }

        pos += ext_len;
    }

    Some(info)
}

/// Slice holding the extensions block, clipped to the buffer.
fn locate_extensions(data: &[u8]) -> Option<&[u8]> {
    let mut pos = SESSION_ID_OFFSET;

    let session_id_len = usize::from(*data.get(pos)?);
    pos += 1 + session_id_len;

    let cipher_suites_len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
    pos += 2 + cipher_suites_len;

    let compression_len = usize::from(*data.get(pos)?);
    pos += 1 + compression_len;

    let extensions_len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
    pos += 2;

    let start = pos.min(data.len());
    let end = (pos + extensions_len).min(data.len());
    Some(&data[start..end])
}

/// Parse SNI extension data to extract the first host name entry
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }

    let list_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let end = (2 + list_len).min(data.len());
    let mut pos = 2;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = usize::from(u16::from_be_bytes([data[pos + 1], data[pos + 2]]));
        pos += 3;

        let name = data.get(pos..pos + name_len)?;
        if name_type == TLS_SNI_NAME_TYPE_HOSTNAME {
            return ascii_hostname(name);
        }
        pos += name_len;
    }

    None
}

/// Parse ALPN extension data to extract protocol list
fn parse_alpn_extension(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    if data.len() < 2 {
        return protocols;
    }

    let list_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let end = (2 + list_len).min(data.len());
    let mut pos = 2;

    while pos < end {
        let proto_len = usize::from(data[pos]);
        pos += 1;
        let Some(proto) = data.get(pos..pos + proto_len) else {
            break;
        };
        if let Ok(proto) = std::str::from_utf8(proto) {
            protocols.push(proto.to_string());
        }
        pos += proto_len;
    }

    protocols
}

fn ascii_hostname(name: &[u8]) -> Option<String> {
    if name.is_empty() || !name.iter().all(|&b| b.is_ascii() && b != 0) {
        return None;
    }
    String::from_utf8(name.to_vec()).ok()
}
