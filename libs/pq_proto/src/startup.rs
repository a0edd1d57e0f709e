use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Special values the first Int32 following the length prefix can take
/// instead of a protocol version. See the PostgreSQL FE/BE protocol docs,
/// "Special Care Regarding Authentication Requests".
const SSL_REQUEST_CODE: i32 = 80877103;
const GSS_ENC_REQUEST_CODE: i32 = 80877104;
const CANCEL_REQUEST_CODE: i32 = 80877102;
const PROTOCOL_VERSION_3: i32 = 196608; // 3.0, encoded as (3 << 16) | 0

/// Upper bound on a StartupMessage's declared length, enforced before the
/// rest of the message is even buffered. Keeps a client from parking the
/// decoder on a multi-gigabyte "length" claim it never intends to send.
pub const MAX_STARTUP_MESSAGE_LEN: usize = 1024 * 1024;

/// What kind of opening handshake a client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupKind {
    /// A real StartupMessage (protocol 3.0) carrying connection parameters.
    Standard { database: String, params: Vec<(String, String)> },
    /// `SSLRequest`: the client is negotiating TLS before the real startup.
    SslRequest,
    /// `GSSENCRequest`: the client is negotiating GSSAPI encryption.
    GssEncRequest,
    /// `CancelRequest`: not a session at all, just a request to cancel one.
    CancelRequest { process_id: i32, secret_key: i32 },
    /// A protocol version (or special code) this router doesn't recognize.
    Unsupported { requested_code: i32 },
}

/// A decoded opening handshake message, plus its raw bytes for replay to a
/// backend that expects to perform its own startup negotiation.
#[derive(Debug, Clone)]
pub struct StartupDescriptor {
    pub raw: Bytes,
    pub kind: StartupKind,
}

impl StartupDescriptor {
    pub fn database(&self) -> Option<&str> {
        match &self.kind {
            StartupKind::Standard { database, .. } => Some(database.as_str()),
            _ => None,
        }
    }
}

/// Attempts to decode one opening-handshake message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete message -
/// the caller should read more bytes and try again. On success, the
/// consumed bytes are removed from `buf`.
pub fn decode_startup(buf: &mut BytesMut) -> Result<Option<StartupDescriptor>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = BigEndian::read_i32(&buf[..4]);
    if len < 8 {
        return Err(ProtocolError::MessageTooShort(len));
    }
    let len = len as usize;
    if len > MAX_STARTUP_MESSAGE_LEN {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: MAX_STARTUP_MESSAGE_LEN,
        });
    }

    if buf.len() < len {
        return Ok(None);
    }

    let mut message = buf.split_to(len);
    let raw = message.clone().freeze();
    message.advance(4);
    let code = BigEndian::read_i32(&message[..4]);
    message.advance(4);

    let kind = match code {
        SSL_REQUEST_CODE => StartupKind::SslRequest,
        GSS_ENC_REQUEST_CODE => StartupKind::GssEncRequest,
        CANCEL_REQUEST_CODE => {
            if message.len() < 8 {
                return Err(ProtocolError::TruncatedCancelRequest);
            }
            let process_id = BigEndian::read_i32(&message[..4]);
            let secret_key = BigEndian::read_i32(&message[4..8]);
            StartupKind::CancelRequest { process_id, secret_key }
        }
        PROTOCOL_VERSION_3 => {
            let params = parse_params(&message)?;
            let database = pick_database(&params)?;
            StartupKind::Standard { database, params }
        }
        other => StartupKind::Unsupported { requested_code: other },
    };

    Ok(Some(StartupDescriptor { raw, kind }))
}

/// Parses the NUL-terminated `key\0value\0...\0` parameter list that
/// follows the protocol version in a StandardStartup message.
fn parse_params(body: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut params = Vec::new();
    let mut rest = body;

    loop {
        if rest.is_empty() {
            return Err(ProtocolError::MalformedParameters);
        }
        if rest[0] == 0 {
            // Trailing single NUL terminates the parameter list.
            break;
        }

        let (key, after_key) = split_cstr(rest)?;
        let (value, after_value) = split_cstr(after_key)?;
        params.push((key, value));
        rest = after_value;
    }

    Ok(params)
}

fn split_cstr(buf: &[u8]) -> Result<(String, &[u8]), ProtocolError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::MalformedParameters)?;
    let s = std::str::from_utf8(&buf[..nul])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_owned();
    Ok((s, &buf[nul + 1..]))
}

/// `database` wins when present; PostgreSQL itself falls back to `user`
/// when the client omits it (libpq does this on the client side too).
fn pick_database(params: &[(String, String)]) -> Result<String, ProtocolError> {
    if let Some((_, v)) = params.iter().find(|(k, _)| k == "database") {
        return Ok(v.clone());
    }
    if let Some((_, v)) = params.iter().find(|(k, _)| k == "user") {
        return Ok(v.clone());
    }
    Err(ProtocolError::MissingDatabase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn encode_standard(params: &[(&str, &str)]) -> BytesMut {
        let mut body = BytesMut::new();
        for (k, v) in params {
            body.put_slice(k.as_bytes());
            body.put_u8(0);
            body.put_slice(v.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);

        let len = 4 + 4 + body.len();
        let mut out = BytesMut::with_capacity(len);
        out.put_i32(len as i32);
        out.put_i32(PROTOCOL_VERSION_3);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn decodes_standard_startup_with_database() {
        let mut buf = encode_standard(&[("user", "alice"), ("database", "tenant_a")]);
        let descriptor = decode_startup(&mut buf).unwrap().unwrap();
        assert_eq!(descriptor.database(), Some("tenant_a"));
        assert!(buf.is_empty());
    }

    #[test]
    fn falls_back_to_user_when_database_absent() {
        let mut buf = encode_standard(&[("user", "bob")]);
        let descriptor = decode_startup(&mut buf).unwrap().unwrap();
        assert_eq!(descriptor.database(), Some("bob"));
    }

    #[test]
    fn missing_both_keys_is_an_error() {
        let mut buf = encode_standard(&[("application_name", "psql")]);
        assert_eq!(decode_startup(&mut buf), Err(ProtocolError::MissingDatabase));
    }

    #[test]
    fn incomplete_length_prefix_asks_for_more_bytes() {
        let mut buf = BytesMut::from(&b"\x00\x00"[..]);
        assert_eq!(decode_startup(&mut buf), Ok(None));
    }

    #[test]
    fn delivered_one_byte_at_a_time_still_decodes() {
        let full = encode_standard(&[("database", "tenant_b")]);
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in full.iter() {
            buf.put_u8(*byte);
            result = decode_startup(&mut buf).unwrap();
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result.unwrap().database(), Some("tenant_b"));
    }

    #[test]
    fn recognizes_ssl_request() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        assert_eq!(
            decode_startup(&mut buf).unwrap().unwrap().kind,
            StartupKind::SslRequest
        );
    }

    #[test]
    fn recognizes_cancel_request() {
        let mut buf = BytesMut::new();
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(4321);
        buf.put_i32(99);
        let descriptor = decode_startup(&mut buf).unwrap().unwrap();
        assert_eq!(
            descriptor.kind,
            StartupKind::CancelRequest {
                process_id: 4321,
                secret_key: 99
            }
        );
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_i32((MAX_STARTUP_MESSAGE_LEN + 1) as i32);
        buf.put_i32(PROTOCOL_VERSION_3);
        assert_eq!(
            decode_startup(&mut buf),
            Err(ProtocolError::MessageTooLarge {
                len: MAX_STARTUP_MESSAGE_LEN + 1,
                max: MAX_STARTUP_MESSAGE_LEN,
            })
        );
    }

    #[test]
    fn rejects_length_below_minimum() {
        let mut buf = BytesMut::new();
        buf.put_i32(4);
        assert_eq!(decode_startup(&mut buf), Err(ProtocolError::MessageTooShort(4)));
    }

    #[test]
    fn unknown_code_is_unsupported_not_an_error() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(123456);
        let descriptor = decode_startup(&mut buf).unwrap().unwrap();
        assert_eq!(descriptor.kind, StartupKind::Unsupported { requested_code: 123456 });
    }
}
