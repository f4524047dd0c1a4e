//! Packet struct with typed constructors.

use bytes::Bytes;

/// A decoded protocol frame.
///
/// For data packets `data` is the message body; for heartbeats it is an
/// optional timestamp supplied by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Heartbeat flag (header bit 7 in legacy mode).
    pub heartbeat: bool,
    /// Extension op code (low 7 header bits).
    pub ext_code: u8,
    /// Message route (data packets only).
    pub route: u32,
    /// Message sequence number (data packets only).
    pub seq: u32,
    /// Message body, zero-copy via `bytes::Bytes`.
    pub data: Bytes,
}

impl Packet {
    /// Create a data packet.
    pub fn new(route: u32, seq: u32, data: Bytes) -> Self {
        Self {
            heartbeat: false,
            ext_code: 0,
            route,
            seq,
            data,
        }
    }

    /// Create a heartbeat packet.
    pub fn heartbeat(ext_code: u8) -> Self {
        Self {
            heartbeat: true,
            ext_code,
            route: 0,
            seq: 0,
            data: Bytes::new(),
        }
    }

    /// Check if this is a heartbeat packet.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet() {
        let pkt = Packet::new(1001, 7, Bytes::from_static(b"abc"));
        assert!(!pkt.is_heartbeat());
        assert_eq!(pkt.route, 1001);
        assert_eq!(pkt.seq, 7);
        assert_eq!(&pkt.data[..], b"abc");
    }

    #[test]
    fn test_heartbeat_packet() {
        let pkt = Packet::heartbeat(0x15);
        assert!(pkt.is_heartbeat());
        assert_eq!(pkt.ext_code, 0x15);
        assert!(pkt.data.is_empty());
    }
}
