//! QoS acknowledgement packets
//!
//! PUBACK, PUBREC, PUBREL and PUBCOMP share the same two-byte body: the
//! packet id of the PUBLISH flow they advance.

use bytes::{BufMut, Bytes};

use crate::error::Result;
use crate::packet::decode_u16;

macro_rules! define_ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }

            pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                buf.put_u16(self.packet_id);
                Ok(())
            }

            pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
                Ok(Self {
                    packet_id: decode_u16(buf, "packet id")?,
                })
            }
        }
    };
}

define_ack_packet! {
    /// Acknowledges a QoS 1 PUBLISH, completing the flow.
    PubAckPacket
}

define_ack_packet! {
    /// First receiver-side step of the QoS 2 handshake.
    PubRecPacket
}

define_ack_packet! {
    /// Sender-side release of a QoS 2 flow; fixed-header flags are `0x02`.
    PubRelPacket
}

define_ack_packet! {
    /// Final step of the QoS 2 handshake.
    PubCompPacket
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::BytesMut;

    #[test]
    fn ack_packets_are_four_bytes_on_the_wire() {
        for packet in [
            Packet::PubAck(PubAckPacket::new(42)),
            Packet::PubRec(PubRecPacket::new(42)),
            Packet::PubRel(PubRelPacket::new(42)),
            Packet::PubComp(PubCompPacket::new(42)),
        ] {
            let mut buf = BytesMut::new();
            packet.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), 4);
            assert_eq!(packet.encoded_len(), 4);
            assert_eq!(Packet::decode(&mut buf).unwrap(), Some(packet));
        }
    }

    #[test]
    fn pubrel_wire_flags() {
        let mut buf = BytesMut::new();
        Packet::PubRel(PubRelPacket::new(1)).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x62);
    }
}
