//! DIRCON frame codec (§4.4): a fixed 6-byte header followed by `mesg_len`
//! bytes of payload. The header is frame-level big-endian; FTMS/CPS
//! characteristic payload fields are little-endian and are encoded/decoded
//! by the handlers in `handlers.rs`, never by this module.

use crate::byte_codec::{Endian, Reader, Writer};
use crate::error::ProtocolError;

pub const DIRCON_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesgId {
    DiscoverServices = 0x01,
    DiscoverCharacteristics = 0x02,
    ReadCharacteristic = 0x03,
    WriteCharacteristic = 0x04,
    EnableCharacteristicNotifications = 0x05,
    UnsolicitedCharacteristicNotification = 0x06,
    Error = 0xFF,
}

impl MesgId {
    pub fn from_u8(v: u8) -> Option<MesgId> {
        match v {
            0x01 => Some(MesgId::DiscoverServices),
            0x02 => Some(MesgId::DiscoverCharacteristics),
            0x03 => Some(MesgId::ReadCharacteristic),
            0x04 => Some(MesgId::WriteCharacteristic),
            0x05 => Some(MesgId::EnableCharacteristicNotifications),
            0x06 => Some(MesgId::UnsolicitedCharacteristicNotification),
            0xFF => Some(MesgId::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespCode {
    Success = 0x00,
    UnknownMessage = 0x01,
    UnexpectedError = 0x02,
    ServiceNotFound = 0x03,
    CharacteristicNotFound = 0x04,
    CharacteristicOperationNotSupported = 0x05,
    CharacteristicWriteFailed = 0x06,
    UnknownProtocol = 0x07,
}

impl RespCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A fully parsed DIRCON frame. `payload` is owned so frames can outlive
/// the receive buffer they were parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub mesg_id: u8,
    pub seq_num: u8,
    pub resp_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(mesg_id: MesgId, seq_num: u8, resp_code: RespCode, payload: Vec<u8>) -> Self {
        Frame {
            version: DIRCON_VERSION,
            mesg_id: mesg_id as u8,
            seq_num,
            resp_code: resp_code.as_u8(),
            payload,
        }
    }

    /// Parse a header already read from the wire (exactly `HEADER_LEN` bytes)
    /// into `(frame-without-payload, mesg_len)`. The caller reads `mesg_len`
    /// payload bytes separately and calls `with_payload`.
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(Frame, u16), ProtocolError> {
        let mut r = Reader::new(header, Endian::Big);
        let version = r.read_u8()?;
        let mesg_id = r.read_u8()?;
        let seq_num = r.read_u8()?;
        let resp_code = r.read_u8()?;
        let mesg_len = r.read_u16()?;

        Ok((
            Frame {
                version,
                mesg_id,
                seq_num,
                resp_code,
                payload: Vec::new(),
            },
            mesg_len,
        ))
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Encode the full frame (header + payload) for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_LEN + self.payload.len(), Endian::Big);
        w.write_u8(self.version);
        w.write_u8(self.mesg_id);
        w.write_u8(self.seq_num);
        w.write_u8(self.resp_code);
        w.write_u16(self.payload.len() as u16);
        w.write_bytes(&self.payload);
        w.into_inner()
    }

    /// Validate version and message id per §4.5.7 step 4. Only
    /// `DiscoverServices..=UnsolicitedCharacteristicNotification` (1..=6) are
    /// accepted; anything else — including the reserved `Error` id `0xFF` —
    /// is rejected so the caller drops the frame with no response.
    pub fn validate(&self) -> Result<MesgId, ProtocolError> {
        if self.version != DIRCON_VERSION {
            return Err(ProtocolError::UnknownVersion(self.version));
        }
        if !(MesgId::DiscoverServices as u8..=MesgId::UnsolicitedCharacteristicNotification as u8).contains(&self.mesg_id) {
            return Err(ProtocolError::UnknownMessageId(self.mesg_id));
        }
        MesgId::from_u8(self.mesg_id).ok_or(ProtocolError::UnknownMessageId(self.mesg_id))
    }
}

/// Request/response classification (§4.4). The emulator never originates a
/// DIRCON request of its own, so `response_pending` only ever becomes true
/// transiently while waiting to drain a write; this exists to make that
/// invariant checkable rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Request,
    Response,
}

pub fn classify(response_pending: bool, last_tx_seq: u8, seq_num: u8) -> FrameClass {
    if response_pending && seq_num == last_tx_seq {
        FrameClass::Response
    } else {
        FrameClass::Request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let f = Frame::new(MesgId::DiscoverServices, 7, RespCode::Success, vec![1, 2, 3, 4]);
        let wire = f.encode();
        assert_eq!(wire.len(), HEADER_LEN + 4);
        assert_eq!(&wire[4..6], &[0x00, 0x04]);

        let header: [u8; HEADER_LEN] = wire[..HEADER_LEN].try_into().unwrap();
        let (parsed, mesg_len) = Frame::parse_header(&header).unwrap();
        assert_eq!(mesg_len as usize, f.payload.len());
        let parsed = parsed.with_payload(wire[HEADER_LEN..].to_vec());
        assert_eq!(parsed, f);
    }

    #[test]
    fn mesg_len_equals_payload_len_for_any_payload() {
        for n in [0usize, 1, 6, 255, 1000] {
            let f = Frame::new(MesgId::ReadCharacteristic, 0, RespCode::Success, vec![0xAB; n]);
            let wire = f.encode();
            let len = u16::from_be_bytes([wire[4], wire[5]]) as usize;
            assert_eq!(len, n);
        }
    }

    #[test]
    fn validate_rejects_bad_version() {
        let mut f = Frame::new(MesgId::DiscoverServices, 0, RespCode::Success, vec![]);
        f.version = 0x02;
        assert!(matches!(f.validate(), Err(ProtocolError::UnknownVersion(2))));
    }

    #[test]
    fn validate_rejects_unknown_mesg_id() {
        let mut f = Frame::new(MesgId::DiscoverServices, 0, RespCode::Success, vec![]);
        f.mesg_id = 0x42;
        assert!(matches!(f.validate(), Err(ProtocolError::UnknownMessageId(0x42))));
    }

    #[test]
    fn validate_rejects_reserved_error_id() {
        let mut f = Frame::new(MesgId::DiscoverServices, 0, RespCode::Success, vec![]);
        f.mesg_id = 0xFF;
        assert!(matches!(f.validate(), Err(ProtocolError::UnknownMessageId(0xFF))));
    }

    #[test]
    fn classify_always_request_when_not_pending() {
        assert_eq!(classify(false, 0xFF, 0xFF), FrameClass::Request);
    }

    #[test]
    fn classify_response_requires_pending_and_matching_seq() {
        assert_eq!(classify(true, 5, 5), FrameClass::Response);
        assert_eq!(classify(true, 5, 6), FrameClass::Request);
    }

    #[test]
    fn discover_services_request_matches_wire_literal() {
        let f = Frame::new(MesgId::DiscoverServices, 7, RespCode::Success, vec![]);
        let wire = f.encode();
        assert_eq!(wire, vec![0x01, 0x01, 0x07, 0x00, 0x00, 0x00]);
    }
}
