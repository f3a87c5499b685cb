use bytes::{Buf, BufMut};

use crate::constants::{AUTH_VECTOR_SIZE, HEADER_SIZE};
use crate::types::{CodeSet, PacketCode, ProtocolError};

/// The fixed 20-octet RADIUS header: code, id, big-endian length and the
/// request authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub code: PacketCode,
    pub id: u8,
    pub length: u16,
    pub authenticator: [u8; AUTH_VECTOR_SIZE],
}

impl PacketHeader {
    pub fn new(code: PacketCode, id: u8) -> Self {
        Self {
            code,
            id,
            length: HEADER_SIZE as u16,
            authenticator: [0; AUTH_VECTOR_SIZE],
        }
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtocolError::TooShort(buf.remaining()));
        }

        let code = PacketCode::try_from(buf.get_u8())?;
        let id = buf.get_u8();
        let length = buf.get_u16();

        let mut authenticator = [0; AUTH_VECTOR_SIZE];
        buf.copy_to_slice(&mut authenticator);

        Ok(Self {
            code,
            id,
            length,
            authenticator,
        })
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.code as u8);
        buf.put_u8(self.id);
        buf.put_u16(self.length);
        buf.put_slice(&self.authenticator);
    }
}

/// Validate a raw datagram far enough to admit it into the tracking path.
///
/// Checks length sanity and the allowed-code set. Attribute level validation
/// and authenticator verification belong to the leaf codec.
pub fn validate_datagram(packet: &[u8], allowed: &CodeSet) -> Result<PacketHeader, ProtocolError> {
    if packet.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort(packet.len()));
    }

    let header = PacketHeader::read(&mut &packet[..])?;

    let length = header.length as usize;
    if length < HEADER_SIZE || length > packet.len() {
        return Err(ProtocolError::BadLength {
            length,
            actual: packet.len(),
        });
    }

    if !allowed.contains(header.code) {
        return Err(ProtocolError::DisallowedCode(header.code));
    }

    Ok(header)
}

/// The header octets used for duplicate and conflict detection.
///
/// Two packets with the same (code, id, address) are considered identical
/// when these 20 octets match; the attribute body is not compared.
pub fn request_signature(packet: &[u8]) -> [u8; HEADER_SIZE] {
    let mut signature = [0; HEADER_SIZE];
    signature.copy_from_slice(&packet[..HEADER_SIZE]);
    signature
}

/// Authenticator verification hook for the leaf codec.
///
/// The core only needs a yes/no answer per packet; concrete HMAC checks are
/// provided by the codec implementation behind this trait.
pub trait PacketVerifier: Send + Sync {
    fn verify(&self, packet: &[u8], secret: &[u8]) -> bool;
}

/// Accepts every packet. Used when the deployment delegates verification to
/// the method modules.
#[derive(Debug, Default)]
pub struct NullVerifier;

impl PacketVerifier for NullVerifier {
    fn verify(&self, _packet: &[u8], _secret: &[u8]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(code: u8, id: u8, len: u16) -> Vec<u8> {
        let mut buf = vec![code, id];
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0xab; AUTH_VECTOR_SIZE]);
        buf.resize(len as usize, 0);
        buf
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        let mut header = PacketHeader::new(PacketCode::AccessRequest, 0x2a);
        header.length = 38;
        header.authenticator = [7; AUTH_VECTOR_SIZE];
        header.write(&mut buf);

        let parsed = PacketHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_short_packet() {
        let allowed = CodeSet::new([PacketCode::AccessRequest]);
        let err = validate_datagram(&[1, 0, 0], &allowed).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort(3)));
    }

    #[test]
    fn rejects_bad_length_field() {
        let allowed = CodeSet::new([PacketCode::AccessRequest]);
        let mut raw = packet(1, 7, 20);
        raw[2..4].copy_from_slice(&100u16.to_be_bytes());
        let err = validate_datagram(&raw, &allowed).unwrap_err();
        assert!(matches!(err, ProtocolError::BadLength { .. }));
    }

    #[test]
    fn rejects_disallowed_code() {
        let allowed = CodeSet::new([PacketCode::AccessRequest]);
        let raw = packet(4, 7, 20);
        let err = validate_datagram(&raw, &allowed).unwrap_err();
        assert!(matches!(err, ProtocolError::DisallowedCode(_)));
    }

    #[test]
    fn signature_is_header_only() {
        let mut a = packet(1, 7, 24);
        let mut b = packet(1, 7, 24);
        a[21] = 1;
        b[21] = 2;
        assert_eq!(request_signature(&a), request_signature(&b));
    }
}
