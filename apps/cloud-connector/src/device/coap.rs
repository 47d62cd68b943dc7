//! Just enough CoAP (RFC 7252) to issue a confirmable GET and read the
//! answer.

use crate::error::DeviceReadError;
use bytes::{BufMut, BytesMut};

pub(super) const DEFAULT_PORT: u16 = 5683;

const VERSION: u8 = 1;
pub(super) const TYPE_CON: u8 = 0;
pub(super) const TYPE_ACK: u8 = 2;
pub(super) const TYPE_RST: u8 = 3;
const CODE_GET: u8 = 0x01;
pub(super) const CODE_EMPTY: u8 = 0x00;
const OPTION_URI_PATH: u16 = 11;
const PAYLOAD_MARKER: u8 = 0xFF;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Message {
    pub(super) kind: u8,
    pub(super) code: u8,
    pub(super) message_id: u16,
    pub(super) token: Vec<u8>,
    pub(super) payload: Vec<u8>,
}

impl Message {
    pub(super) fn code_class(&self) -> u8 {
        self.code >> 5
    }

    pub(super) fn code_detail(&self) -> u8 {
        self.code & 0x1F
    }
}

pub(super) fn encode_get(message_id: u16, token: &[u8], path: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + token.len() + path.len() + 8);
    buf.put_u8((VERSION << 6) | (TYPE_CON << 4) | token.len() as u8);
    buf.put_u8(CODE_GET);
    buf.put_u16(message_id);
    buf.put_slice(token);

    let mut previous = 0u16;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        put_option(&mut buf, OPTION_URI_PATH - previous, segment.as_bytes());
        previous = OPTION_URI_PATH;
    }
    buf
}

pub(super) fn encode_empty_ack(message_id: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u8((VERSION << 6) | (TYPE_ACK << 4));
    buf.put_u8(CODE_EMPTY);
    buf.put_u16(message_id);
    buf
}

fn put_option(buf: &mut BytesMut, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = option_nibble(delta);
    let (len_nibble, len_ext) = option_nibble(value.len() as u16);
    buf.put_u8((delta_nibble << 4) | len_nibble);
    put_extension(buf, delta_ext);
    put_extension(buf, len_ext);
    buf.put_slice(value);
}

enum Extension {
    None,
    One(u8),
    Two(u16),
}

fn option_nibble(value: u16) -> (u8, Extension) {
    match value {
        0..=12 => (value as u8, Extension::None),
        13..=268 => (13, Extension::One((value - 13) as u8)),
        _ => (14, Extension::Two(value - 269)),
    }
}

fn put_extension(buf: &mut BytesMut, ext: Extension) {
    match ext {
        Extension::None => {}
        Extension::One(value) => buf.put_u8(value),
        Extension::Two(value) => buf.put_u16(value),
    }
}

pub(super) fn decode(buf: &[u8]) -> Result<Message, DeviceReadError> {
    if buf.len() < HEADER_LEN {
        return Err(malformed("datagram shorter than header"));
    }
    let version = buf[0] >> 6;
    if version != VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let kind = (buf[0] >> 4) & 0x03;
    let token_len = (buf[0] & 0x0F) as usize;
    if token_len > 8 {
        return Err(malformed(format!("token length {token_len}")));
    }
    let code = buf[1];
    let message_id = u16::from_be_bytes([buf[2], buf[3]]);

    let mut pos = HEADER_LEN;
    let token = buf
        .get(pos..pos + token_len)
        .ok_or_else(|| malformed("truncated token"))?
        .to_vec();
    pos += token_len;

    let mut payload = Vec::new();
    while pos < buf.len() {
        let byte = buf[pos];
        pos += 1;
        if byte == PAYLOAD_MARKER {
            if pos == buf.len() {
                return Err(malformed("payload marker without payload"));
            }
            payload = buf[pos..].to_vec();
            break;
        }
        read_extension(buf, &mut pos, byte >> 4)?;
        let len = read_extension(buf, &mut pos, byte & 0x0F)? as usize;
        if pos + len > buf.len() {
            return Err(malformed("truncated option value"));
        }
        pos += len;
    }

    Ok(Message {
        kind,
        code,
        message_id,
        token,
        payload,
    })
}

fn read_extension(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<u16, DeviceReadError> {
    match nibble {
        0..=12 => Ok(nibble as u16),
        13 => {
            let value = *buf.get(*pos).ok_or_else(|| malformed("truncated option"))?;
            *pos += 1;
            Ok(value as u16 + 13)
        }
        14 => {
            let raw = buf
                .get(*pos..*pos + 2)
                .ok_or_else(|| malformed("truncated option"))?;
            *pos += 2;
            Ok(u16::from_be_bytes([raw[0], raw[1]]).saturating_add(269))
        }
        _ => Err(malformed("reserved option nibble")),
    }
}

fn malformed(message: impl Into<String>) -> DeviceReadError {
    DeviceReadError::Malformed(message.into())
}

#[cfg(test)]
pub(super) fn encode_response(
    kind: u8,
    code: u8,
    message_id: u16,
    token: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8((VERSION << 6) | (kind << 4) | token.len() as u8);
    buf.put_u8(code);
    buf.put_u16(message_id);
    buf.put_slice(token);
    if !payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(payload);
    }
    buf.to_vec()
}

#[cfg(test)]
pub(super) fn uri_path(buf: &[u8]) -> Option<String> {
    let token_len = (buf.first()? & 0x0F) as usize;
    let mut pos = HEADER_LEN + token_len;
    let mut number = 0u16;
    let mut segments = Vec::new();
    while pos < buf.len() && buf[pos] != PAYLOAD_MARKER {
        let byte = buf[pos];
        pos += 1;
        number += read_extension(buf, &mut pos, byte >> 4).ok()?;
        let len = read_extension(buf, &mut pos, byte & 0x0F).ok()? as usize;
        if number == OPTION_URI_PATH {
            segments.push(String::from_utf8(buf.get(pos..pos + len)?.to_vec()).ok()?);
        }
        pos += len;
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_confirmable_get_with_uri_path() {
        let encoded = encode_get(0x1234, &[0xAA, 0xBB], "s/t");
        assert_eq!(
            encoded.as_ref(),
            &[0x42, 0x01, 0x12, 0x34, 0xAA, 0xBB, 0xB1, b's', 0x01, b't']
        );
        assert_eq!(uri_path(&encoded).as_deref(), Some("s/t"));
    }

    #[test]
    fn long_segments_use_extended_length() {
        let segment = "a".repeat(20);
        let encoded = encode_get(1, &[], &segment);
        assert_eq!(&encoded[4..6], &[0xBD, 20 - 13]);
        assert_eq!(uri_path(&encoded), Some(segment));
    }

    #[test]
    fn decodes_piggybacked_content() {
        let raw = encode_response(TYPE_ACK, 0x45, 7, &[1, 2, 3, 4], &[0x80, 0x00]);
        let message = decode(&raw).unwrap();
        assert_eq!(message.kind, TYPE_ACK);
        assert_eq!(message.code_class(), 2);
        assert_eq!(message.code_detail(), 5);
        assert_eq!(message.message_id, 7);
        assert_eq!(message.token, vec![1, 2, 3, 4]);
        assert_eq!(message.payload, vec![0x80, 0x00]);
    }

    #[test]
    fn decode_skips_options() {
        let mut raw = encode_get(9, &[5], "s/h").to_vec();
        raw.push(PAYLOAD_MARKER);
        raw.extend_from_slice(&[1, 2]);
        let message = decode(&raw).unwrap();
        assert_eq!(message.payload, vec![1, 2]);
    }

    #[test]
    fn rejects_truncated_datagrams() {
        assert!(decode(&[0x40, 0x45]).is_err());
        assert!(decode(&[0x44, 0x45, 0x00, 0x01, 0xAA]).is_err());
        assert!(decode(&[0x40, 0x45, 0x00, 0x01, PAYLOAD_MARKER]).is_err());
    }
}
