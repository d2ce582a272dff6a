//! CONNECT and CONNACK packets

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ProtocolError, Result};
use crate::packet::{decode_binary, decode_string, decode_u16, encode_string, truncated};
use crate::types::{ConnectReturnCode, QoS};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// Will message declared at connect time and published by the broker when
/// the client goes away without a DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// MQTT v3.1.1 CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: &[u8]) -> Self {
        self.username = Some(username.into());
        self.password = Some(Bytes::copy_from_slice(password));
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= FLAG_WILL | (will.qos.as_u8() << 3);
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }

    pub(crate) fn body_len(&self) -> usize {
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();
        if let Some(ref will) = self.will {
            len += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }
        len
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);
        encode_string(buf, &self.client_id)?;
        if let Some(ref will) = self.will {
            encode_string(buf, &will.topic)?;
            let len = u16::try_from(will.payload.len()).map_err(|_| {
                ProtocolError::PacketTooLarge {
                    size: will.payload.len(),
                    max: usize::from(u16::MAX),
                }
            })?;
            buf.put_u16(len);
            buf.put_slice(&will.payload);
        }
        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            buf.put_u16(password.len() as u16);
            buf.put_slice(password);
        }
        Ok(())
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let protocol_name = decode_string(buf, "protocol name")?;
        if protocol_name != PROTOCOL_NAME {
            return Err(ProtocolError::MalformedPacket(format!(
                "unexpected protocol name: {protocol_name:?}"
            )));
        }
        if !buf.has_remaining() {
            return Err(truncated("protocol level"));
        }
        let level = buf.get_u8();
        if level != PROTOCOL_LEVEL {
            return Err(ProtocolError::UnsupportedProtocolVersion(level));
        }

        if !buf.has_remaining() {
            return Err(truncated("connect flags"));
        }
        let flags = buf.get_u8();
        if flags & 0x01 != 0 {
            return Err(ProtocolError::MalformedPacket(
                "CONNECT reserved flag bit is set".into(),
            ));
        }

        let has_will = flags & FLAG_WILL != 0;
        let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
        let will_retain = flags & FLAG_WILL_RETAIN != 0;
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(ProtocolError::MalformedPacket(
                "will QoS/retain set without will flag".into(),
            ));
        }
        let has_username = flags & FLAG_USERNAME != 0;
        let has_password = flags & FLAG_PASSWORD != 0;
        if has_password && !has_username {
            return Err(ProtocolError::MalformedPacket(
                "password flag set without username flag".into(),
            ));
        }

        let keep_alive = decode_u16(buf, "keep alive")?;
        let client_id = decode_string(buf, "client id")?;

        let will = if has_will {
            let topic = decode_string(buf, "will topic")?;
            let payload = decode_binary(buf, "will payload")?;
            Some(LastWill {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if has_username {
            Some(decode_string(buf, "username")?)
        } else {
            None
        };
        let password = if has_password {
            Some(decode_binary(buf, "password")?)
        } else {
            None
        };

        Ok(Self {
            client_id,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            keep_alive,
            will,
            username,
            password,
        })
    }
}

/// CONNACK packet; `session_present` is the low bit of the ack-flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    pub(crate) fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.return_code.as_u8());
        Ok(())
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(truncated("CONNACK body"));
        }
        let ack_flags = buf.get_u8();
        if ack_flags & !0x01 != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "reserved CONNACK ack-flag bits set: 0x{ack_flags:02x}"
            )));
        }
        let return_code = ConnectReturnCode::try_from(buf.get_u8())?;
        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            return_code,
        })
    }
}
