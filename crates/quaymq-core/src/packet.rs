//! MQTT 3.1.1 packet types and codec.
//!
//! [`decode`] parses exactly one complete frame, [`decode_packet`] is the
//! streaming form used on socket buffers, and [`encode`]/[`encode_packet`]
//! serialize any of the fourteen control packets. Both directions are pure
//! functions of their input.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags every packet of this type must carry (PUBLISH excluded).
    fn required_flags(self) -> u8 {
        match self {
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// SUBACK return code for a rejected topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// The decoded view of a fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Exact byte count of the variable header and payload.
    pub remaining_length: usize,
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// `MQTT` for 3.1.1, `MQIsdp` for 3.1.
    pub protocol_name: String,
    /// 4 for 3.1.1, 3 for 3.1. Other levels decode so the broker can refuse them.
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// A 3.1.1 CONNECT with no will and no credentials.
    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos` is above 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Build a PUBLISH with no packet id assigned yet.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS.
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`].
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The fixed header this packet encodes with.
    pub fn fixed_header(&self) -> FixedHeader {
        let (dup, qos, retain) = match self {
            Packet::Publish(p) => (p.dup, p.qos, p.retain),
            _ => (false, QoS::AtMostOnce, false),
        };
        FixedHeader {
            packet_type: self.packet_type(),
            dup,
            qos,
            retain,
            remaining_length: self.remaining_length(),
        }
    }

    /// Length of the variable header plus payload, computed without encoding.
    pub fn remaining_length(&self) -> usize {
        match self {
            Packet::Connect(c) => {
                let mut len = string_len(&c.protocol_name) + 1 + 1 + 2 + string_len(&c.client_id);
                if let Some(ref will) = c.will {
                    len += string_len(&will.topic) + 2 + will.message.len();
                }
                if let Some(ref username) = c.username {
                    len += string_len(username);
                }
                if let Some(ref password) = c.password {
                    len += 2 + password.len();
                }
                len
            }
            Packet::Connack(_) => 2,
            Packet::Publish(p) => {
                let id_len = if p.qos == QoS::AtMostOnce { 0 } else { 2 };
                string_len(&p.topic) + id_len + p.payload.len()
            }
            Packet::Puback { .. }
            | Packet::Pubrec { .. }
            | Packet::Pubrel { .. }
            | Packet::Pubcomp { .. }
            | Packet::Unsuback { .. } => 2,
            Packet::Subscribe(s) => 2 + s.topics.iter().map(|(t, _)| string_len(t) + 1).sum::<usize>(),
            Packet::Suback(s) => 2 + s.return_codes.len(),
            Packet::Unsubscribe(u) => 2 + u.topics.iter().map(|t| string_len(t)).sum::<usize>(),
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => 0,
        }
    }

    fn header_byte(&self) -> u8 {
        let packet_type = self.packet_type();
        let flags = match self {
            Packet::Publish(p) => {
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                flags
            }
            _ => packet_type.required_flags(),
        };
        ((packet_type as u8) << 4) | flags
    }
}

#[inline]
fn string_len(s: &str) -> usize {
    2 + s.len()
}

/// Cursor over a frame body. Running past the end of the body means a field
/// claims more bytes than the Remaining Length allows, which is malformed.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn overrun(&self, needed: usize) -> ProtocolError {
        ProtocolError::MalformedPacket(format!(
            "field needs {} bytes but only {} remain in packet",
            needed,
            self.remaining()
        ))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.overrun(1))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_packet_id(&mut self) -> Result<u16> {
        let id = self.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket("Packet identifier must be non-zero".into()).into());
        }
        Ok(id)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.overrun(len).into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: no U+0000 in UTF-8 strings
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fails if the body has bytes no field accounted for.
    fn finish(&self, packet_type: PacketType) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{:?} has {} unexpected trailing bytes",
                packet_type,
                self.remaining()
            ))
            .into());
        }
        Ok(())
    }
}

/// Decode exactly one complete packet from `buf`.
///
/// The buffer must hold the whole frame and nothing else. A Remaining Length
/// that is longer than four bytes or runs off the end of `buf` is
/// [`ProtocolError::MalformedHeader`]; a body shorter than declared is
/// [`ProtocolError::TruncatedPacket`].
///
/// # Example
/// ```
/// use quaymq_core::{decode, Packet, QoS};
/// let packet = decode(&[0xD0, 0x00]).unwrap();
/// assert_eq!(packet, Packet::Pingresp);
/// assert_eq!(packet.fixed_header().qos, QoS::AtMostOnce);
/// ```
pub fn decode(buf: &[u8]) -> Result<Packet> {
    let Some(&first) = buf.first() else {
        return Err(ProtocolError::MalformedHeader.into());
    };
    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Err(ProtocolError::MalformedHeader.into());
    };

    let total_len = 1 + len_bytes + remaining_len;
    if buf.len() < total_len {
        return Err(ProtocolError::TruncatedPacket {
            needed: total_len,
            have: buf.len(),
        }
        .into());
    }
    if buf.len() > total_len {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} bytes follow the end of the packet",
            buf.len() - total_len
        ))
        .into());
    }

    decode_body(first, &buf[1 + len_bytes..])
}

/// Try to decode a complete packet from the front of a receive buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` when a whole frame is present,
/// `Ok(None)` if more data is needed, or `Err` on protocol errors.
/// `max_packet_size` of 0 disables the size check.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet = decode_body(first, &buf[header_len..total_len])?;
    Ok(Some((packet, total_len)))
}

fn decode_body(first: u8, body: &[u8]) -> Result<Packet> {
    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;

    // MQTT-2.2.2-1/2: reserved flags are fixed for every type except PUBLISH
    if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{:?} fixed header flags must be {:#04x}, got {:#04x}",
            packet_type,
            packet_type.required_flags(),
            flags
        ))
        .into());
    }

    let mut dec = Decoder::new(body);
    let packet = match packet_type {
        PacketType::Connect => decode_connect(&mut dec)?,
        PacketType::Connack => decode_connack(&mut dec)?,
        PacketType::Publish => decode_publish(flags, &mut dec)?,
        PacketType::Puback => Packet::Puback {
            packet_id: dec.read_packet_id()?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: dec.read_packet_id()?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: dec.read_packet_id()?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: dec.read_packet_id()?,
        },
        PacketType::Subscribe => decode_subscribe(&mut dec)?,
        PacketType::Suback => decode_suback(&mut dec)?,
        PacketType::Unsubscribe => decode_unsubscribe(&mut dec)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: dec.read_packet_id()?,
        },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    dec.finish(packet_type)?;
    Ok(packet)
}

fn decode_connect(dec: &mut Decoder<'_>) -> Result<Packet> {
    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    let protocol_level = dec.read_u8()?;

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos_raw = (flags >> 3) & 0x03;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    let will_qos = QoS::try_from(will_qos_raw).map_err(|_| ProtocolError::InvalidConnectFlags(flags))?;

    // MQTT-3.1.2-13/15: will QoS and retain are 0 without a will
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // MQTT-3.1.2-22: password requires username
    if !username_flag && password_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = Bytes::copy_from_slice(dec.read_binary()?);
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?.to_vec())
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(dec: &mut Decoder<'_>) -> Result<Packet> {
    let ack_flags = dec.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "CONNACK reserved flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, dec: &mut Decoder<'_>) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: DUP must be 0 for QoS 0
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket("DUP flag set on QoS 0 PUBLISH".into()).into());
    }

    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_packet_id()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(dec.rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_packet_id()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;

        // MQTT-4.7.3-1: filters are at least one character
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }

        // MQTT-3.8.3-4: upper six bits of the options byte are reserved
        let options = dec.read_u8()?;
        if options & 0xFC != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Reserved bits set in requested QoS byte: {:#04x}",
                options
            ))
            .into());
        }
        topics.push((topic, QoS::try_from(options)?));
    }

    // MQTT-3.8.3-3
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_packet_id()?;
    let return_codes = dec.rest().to_vec();
    if let Some(bad) = return_codes
        .iter()
        .find(|&&code| code > 2 && code != SUBACK_FAILURE)
    {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid SUBACK return code: {:#04x}",
            bad
        ))
        .into());
    }
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_packet_id()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        topics.push(topic);
    }

    // MQTT-3.10.3-2
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

/// Encode a packet into a fresh immutable buffer.
///
/// # Example
/// ```
/// use quaymq_core::{encode, Packet};
/// assert_eq!(&encode(&Packet::Pingresp)[..], &[0xD0, 0x00]);
/// ```
pub fn encode(packet: &Packet) -> Bytes {
    let remaining = packet.remaining_length();
    let mut buf = Vec::with_capacity(1 + varint::encoded_len(remaining) + remaining);
    encode_packet(packet, &mut buf);
    Bytes::from(buf)
}

/// Append the encoding of `packet` to `buf`.
///
/// Strings and binary fields longer than 65535 bytes cannot be represented;
/// callers validate lengths before building packets.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    buf.push(packet.header_byte());
    varint::encode(packet.remaining_length(), buf);

    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => {
            buf.push(u8::from(connack.session_present));
            buf.push(connack.code as u8);
        }
        Packet::Publish(publish) => {
            write_string(&publish.topic, buf);
            if publish.qos != QoS::AtMostOnce {
                buf.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
            }
            buf.extend_from_slice(&publish.payload);
        }
        Packet::Puback { packet_id }
        | Packet::Pubrec { packet_id }
        | Packet::Pubrel { packet_id }
        | Packet::Pubcomp { packet_id }
        | Packet::Unsuback { packet_id } => buf.extend_from_slice(&packet_id.to_be_bytes()),
        Packet::Subscribe(subscribe) => {
            buf.extend_from_slice(&subscribe.packet_id.to_be_bytes());
            for (topic, qos) in &subscribe.topics {
                write_string(topic, buf);
                buf.push(*qos as u8);
            }
        }
        Packet::Suback(suback) => {
            buf.extend_from_slice(&suback.packet_id.to_be_bytes());
            buf.extend_from_slice(&suback.return_codes);
        }
        Packet::Unsubscribe(unsubscribe) => {
            buf.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
            for topic in &unsubscribe.topics {
                write_string(topic, buf);
            }
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
    }
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    write_string(&connect.protocol_name, buf);
    buf.push(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    buf.push(flags);

    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, buf);

    if let Some(ref will) = connect.will {
        write_string(&will.topic, buf);
        write_binary(&will.message, buf);
    }
    if let Some(ref username) = connect.username {
        write_string(username, buf);
    }
    if let Some(ref password) = connect.password {
        write_binary(password, buf);
    }
}

#[inline]
fn write_string(s: &str, buf: &mut Vec<u8>) {
    write_binary(s.as_bytes(), buf);
}

#[inline]
fn write_binary(data: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

// === Topic Validation ===

/// Validate a topic name or filter against length and depth limits.
/// Zero for either limit disables that check.
#[inline]
pub fn validate_topic(topic: &str, max_length: usize, max_levels: usize) -> Result<()> {
    if max_length > 0 && topic.len() > max_length {
        return Err(ProtocolError::TopicTooLong {
            len: topic.len(),
            max: max_length,
        }
        .into());
    }

    if max_levels > 0 {
        let mut levels = 1usize;
        for b in topic.bytes() {
            if b == b'/' {
                levels += 1;
                if levels > max_levels {
                    return Err(ProtocolError::TopicTooDeep {
                        levels,
                        max: max_levels,
                    }
                    .into());
                }
            }
        }
    }

    Ok(())
}
