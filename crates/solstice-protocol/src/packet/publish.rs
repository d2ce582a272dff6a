//! PUBLISH packet

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ProtocolError, Result};
use crate::packet::{decode_string, decode_u16, encode_string};
use crate::types::QoS;

/// MQTT v3.1.1 PUBLISH packet.
///
/// `packet_id` is present on the wire only when `qos` is above
/// [`QoS::AtMostOnce`], which is why the encoded size of the same message
/// differs between subscribers receiving it at different effective levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = (qos != QoS::AtMostOnce).then_some(packet_id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub(crate) fn header_flags(&self) -> u8 {
        let mut flags = self.qos.as_u8() << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    pub(crate) fn body_len(&self) -> usize {
        let packet_id_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        2 + self.topic.len() + packet_id_len + self.payload.len()
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or_else(|| {
                ProtocolError::MalformedPacket("QoS > 0 PUBLISH without packet id".into())
            })?;
            buf.put_u16(packet_id);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub(crate) fn decode_body(flags: u8, buf: &mut Bytes) -> Result<Self> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(ProtocolError::MalformedPacket(
                "DUP flag set on a QoS 0 PUBLISH".into(),
            ));
        }

        let topic = decode_string(buf, "topic name")?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(decode_u16(buf, "packet id")?)
        };
        let payload = buf.split_to(buf.remaining());

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}
