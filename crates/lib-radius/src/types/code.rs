use std::fmt::Display;

use thiserror::Error;

use crate::constants::MAX_PACKET_CODE;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid packet code ({0})")]
    InvalidCode(u8),

    #[error("Packet too short ({0} octets)")]
    TooShort(usize),

    #[error("Header length field {length} disagrees with datagram size {actual}")]
    BadLength { length: usize, actual: usize },

    #[error("Packet code {0} is not allowed on this listener")]
    DisallowedCode(PacketCode),
}

/// RADIUS packet codes the core knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketCode {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
    AccessChallenge = 11,
    StatusServer = 12,
    DisconnectRequest = 40,
    DisconnectAck = 41,
    DisconnectNak = 42,
    CoaRequest = 43,
    CoaAck = 44,
    CoaNak = 45,
}

impl TryFrom<u8> for PacketCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AccessRequest),
            2 => Ok(Self::AccessAccept),
            3 => Ok(Self::AccessReject),
            4 => Ok(Self::AccountingRequest),
            5 => Ok(Self::AccountingResponse),
            11 => Ok(Self::AccessChallenge),
            12 => Ok(Self::StatusServer),
            40 => Ok(Self::DisconnectRequest),
            41 => Ok(Self::DisconnectAck),
            42 => Ok(Self::DisconnectNak),
            43 => Ok(Self::CoaRequest),
            44 => Ok(Self::CoaAck),
            45 => Ok(Self::CoaNak),
            _ => Err(ProtocolError::InvalidCode(value)),
        }
    }
}

impl Display for PacketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AccessRequest => "Access-Request",
            Self::AccessAccept => "Access-Accept",
            Self::AccessReject => "Access-Reject",
            Self::AccountingRequest => "Accounting-Request",
            Self::AccountingResponse => "Accounting-Response",
            Self::AccessChallenge => "Access-Challenge",
            Self::StatusServer => "Status-Server",
            Self::DisconnectRequest => "Disconnect-Request",
            Self::DisconnectAck => "Disconnect-ACK",
            Self::DisconnectNak => "Disconnect-NAK",
            Self::CoaRequest => "CoA-Request",
            Self::CoaAck => "CoA-ACK",
            Self::CoaNak => "CoA-NAK",
        };
        write!(f, "{name}")
    }
}

impl PacketCode {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::AccessRequest
                | Self::AccountingRequest
                | Self::StatusServer
                | Self::DisconnectRequest
                | Self::CoaRequest
        )
    }

    /// The positive response code for a request.
    pub fn ack(&self) -> Option<PacketCode> {
        match self {
            Self::AccessRequest | Self::StatusServer => Some(Self::AccessAccept),
            Self::AccountingRequest => Some(Self::AccountingResponse),
            Self::DisconnectRequest => Some(Self::DisconnectAck),
            Self::CoaRequest => Some(Self::CoaAck),
            _ => None,
        }
    }

    /// The negative response code for a request.
    pub fn nak(&self) -> Option<PacketCode> {
        match self {
            Self::AccessRequest | Self::StatusServer => Some(Self::AccessReject),
            Self::AccountingRequest => None,
            Self::DisconnectRequest => Some(Self::DisconnectNak),
            Self::CoaRequest => Some(Self::CoaNak),
            _ => None,
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            Self::AccessRequest => Priority::HIGH,
            Self::AccountingRequest => Priority::LOW,
            Self::CoaRequest | Self::DisconnectRequest => Priority::NORMAL,
            Self::StatusServer => Priority::NOW,
            _ => Priority::NORMAL,
        }
    }
}

/// Scheduling priority of a packet. Larger values jump the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const HIGH: Priority = Priority(3);
    /// Preempts everything, used for Status-Server.
    pub const NOW: Priority = Priority(4);
}

impl Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of request codes a listener accepts.
#[derive(Debug, Clone, Default)]
pub struct CodeSet {
    allowed: u64,
}

impl CodeSet {
    pub fn new<I: IntoIterator<Item = PacketCode>>(codes: I) -> Self {
        let mut set = Self::default();
        for code in codes {
            set.insert(code);
        }
        set
    }

    pub fn insert(&mut self, code: PacketCode) {
        debug_assert!((code as u8) < MAX_PACKET_CODE);
        self.allowed |= 1 << (code as u8);
    }

    pub fn contains(&self, code: PacketCode) -> bool {
        self.allowed & (1 << (code as u8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.allowed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for raw in [1u8, 2, 3, 4, 5, 11, 12, 40, 41, 42, 43, 44, 45] {
            let code = PacketCode::try_from(raw).unwrap();
            assert_eq!(code as u8, raw);
        }
        assert!(PacketCode::try_from(0).is_err());
        assert!(PacketCode::try_from(6).is_err());
    }

    #[test]
    fn response_codes() {
        assert_eq!(
            PacketCode::AccessRequest.ack(),
            Some(PacketCode::AccessAccept)
        );
        assert_eq!(
            PacketCode::AccessRequest.nak(),
            Some(PacketCode::AccessReject)
        );
        assert_eq!(PacketCode::AccountingRequest.nak(), None);
        assert_eq!(PacketCode::CoaRequest.ack(), Some(PacketCode::CoaAck));
    }

    #[test]
    fn default_priorities() {
        assert_eq!(PacketCode::AccessRequest.default_priority(), Priority::HIGH);
        assert_eq!(
            PacketCode::AccountingRequest.default_priority(),
            Priority::LOW
        );
        assert_eq!(PacketCode::StatusServer.default_priority(), Priority::NOW);
        assert!(Priority::NOW > Priority::HIGH);
    }

    #[test]
    fn code_set_membership() {
        let set = CodeSet::new([PacketCode::AccessRequest, PacketCode::StatusServer]);
        assert!(set.contains(PacketCode::AccessRequest));
        assert!(!set.contains(PacketCode::AccountingRequest));
    }
}
