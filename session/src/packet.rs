//! Length-delimited packet framing with CRC-32 payload integrity.
//!
//! Header layout, big-endian: magic (2), protocol version (1), packet type
//! (1), flags (2), payload length (4), payload CRC-32 (4). The codec
//! implements `tokio_util`'s `Decoder`/`Encoder` so a `Framed` transport
//! can carry it directly; a CRC or header mismatch decodes to
//! [Error::Corrupt].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use base::crc32::crc32;
use base::Error;

pub const MAGIC: u16 = 0xa5c1;
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 14;

/// Ceiling on one payload; larger frames are dropped at render time, never
/// fragmented here.
pub const MAX_PAYLOAD: usize = 8 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Hello = 1,
    SdpOffer = 2,
    SdpAnswer = 3,
    VideoFrame = 4,
    AudioFrame = 5,
    Bye = 6,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Hello),
            2 => Some(PacketType::SdpOffer),
            3 => Some(PacketType::SdpAnswer),
            4 => Some(PacketType::VideoFrame),
            5 => Some(PacketType::AudioFrame),
            6 => Some(PacketType::Bye),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub ptype: PacketType,
    pub flags: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(ptype: PacketType, payload: Bytes) -> Self {
        Packet {
            ptype,
            flags: 0,
            payload,
        }
    }
}

#[derive(Default)]
pub struct PacketCodec {}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..HEADER_LEN];
        let magic = header.get_u16();
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad packet magic {:#06x}", magic)));
        }
        let version = header.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::Corrupt(format!("unsupported protocol version {}", version)));
        }
        let ptype = header.get_u8();
        let ptype = PacketType::from_u8(ptype)
            .ok_or_else(|| Error::Corrupt(format!("unknown packet type {}", ptype)))?;
        let flags = header.get_u16();
        let len = header.get_u32() as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::Corrupt(format!("{}-byte payload exceeds maximum", len)));
        }
        let crc = header.get_u32();
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let actual = crc32(&payload);
        if actual != crc {
            return Err(Error::Corrupt(format!(
                "payload CRC {:#010x} != header CRC {:#010x}",
                actual, crc
            )));
        }
        Ok(Some(Packet {
            ptype,
            flags,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        if item.payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidParam(format!(
                "{}-byte payload exceeds maximum",
                item.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u16(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(item.ptype as u8);
        dst.put_u16(item.flags);
        dst.put_u32(item.payload.len() as u32);
        dst.put_u32(crc32(&item.payload));
        dst.put_slice(&item.payload);
        Ok(())
    }
}
