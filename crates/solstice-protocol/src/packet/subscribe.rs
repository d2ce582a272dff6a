//! SUBSCRIBE, SUBACK, UNSUBSCRIBE and UNSUBACK packets

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ProtocolError, Result};
use crate::packet::{decode_string, decode_u16, encode_string, truncated};
use crate::types::QoS;

/// One `(topic filter, requested QoS)` tuple of a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }

    pub(crate) fn body_len(&self) -> usize {
        2 + self
            .filters
            .iter()
            .map(|f| 2 + f.filter.len() + 1)
            .sum::<usize>()
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.filters.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "SUBSCRIBE must carry at least one topic filter".into(),
            ));
        }
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.qos.as_u8());
        }
        Ok(())
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet id")?;
        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf, "topic filter")?;
            if !buf.has_remaining() {
                return Err(truncated("requested QoS"));
            }
            let qos = QoS::try_from(buf.get_u8())?;
            filters.push(TopicFilter { filter, qos });
        }
        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "SUBSCRIBE with an empty filter list".into(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

/// SUBACK; one granted-QoS byte per requested filter, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub granted: Vec<QoS>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, granted: Vec<QoS>) -> Self {
        Self { packet_id, granted }
    }

    pub(crate) fn body_len(&self) -> usize {
        2 + self.granted.len()
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for qos in &self.granted {
            buf.put_u8(qos.as_u8());
        }
        Ok(())
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet id")?;
        let mut granted = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            granted.push(QoS::try_from(buf.get_u8())?);
        }
        Ok(Self { packet_id, granted })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, filters: Vec<String>) -> Self {
        Self { packet_id, filters }
    }

    pub(crate) fn body_len(&self) -> usize {
        2 + self.filters.iter().map(|f| 2 + f.len()).sum::<usize>()
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet id")?;
        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf, "topic filter")?);
        }
        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "UNSUBSCRIBE with an empty filter list".into(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
}

impl UnsubAckPacket {
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
