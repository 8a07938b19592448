//! The client-service wire protocol (spec §6 "Client-service wire
//! (local)"): a compact framed protocol between this library and the
//! local CADET process. Any framing error forces a reconnect.
//!
//! Encoding goes through [`asynchronous_codec`], the same crate the
//! teacher wraps its own channel cell codec in (`tor_proto::channel::codec`),
//! reduced here to a plain [`Encoder`]/[`Decoder`] pair over a small
//! message enum rather than a dedicated cell type.

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cadet_proto::{ChannelOptions, Ctn, PeerId, TunnelId};

/// Maximum size of one local-wire message; generous relative to
/// `cadet_proto::wire::MAX_CADET_MESSAGE_SIZE` since `LocalData` carries
/// a full application payload plus framing.
pub const MAX_LOCAL_MESSAGE_SIZE: usize = 128 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
enum LocalFrameType {
    PortOpen = 1,
    PortClose = 2,
    ChannelCreate = 3,
    ChannelCreateAck = 4,
    ChannelCreateNack = 5,
    ChannelDestroy = 6,
    LocalData = 7,
    LocalAck = 8,
    InfoRequest = 9,
    InfoReply = 10,
    InfoReplyEnd = 11,
    ChannelIncoming = 12,
}

impl TryFrom<u16> for LocalFrameType {
    type Error = std::io::Error;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        use LocalFrameType::*;
        Ok(match v {
            1 => PortOpen,
            2 => PortClose,
            3 => ChannelCreate,
            4 => ChannelCreateAck,
            5 => ChannelCreateNack,
            6 => ChannelDestroy,
            7 => LocalData,
            8 => LocalAck,
            9 => InfoRequest,
            10 => InfoReply,
            11 => InfoReplyEnd,
            12 => ChannelIncoming,
            _ => return Err(framing_error("unknown local frame type")),
        })
    }
}

/// Which monitoring table an `InfoRequest`/`InfoReply` pair concerns
/// (spec §4.5 `get_peers`/`get_peer`/`get_tunnels`/`get_tunnel`/`get_channel`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfoKind {
    Peers,
    Peer(PeerId),
    Tunnels,
    Tunnel(TunnelId),
    Channel(TunnelId, Ctn),
}

impl InfoKind {
    fn discriminant(&self) -> u8 {
        match self {
            InfoKind::Peers => 0,
            InfoKind::Peer(_) => 1,
            InfoKind::Tunnels => 2,
            InfoKind::Tunnel(_) => 3,
            InfoKind::Channel(..) => 4,
        }
    }

    fn encode_onto(&self, out: &mut BytesMut) {
        out.put_u8(self.discriminant());
        match self {
            InfoKind::Peers | InfoKind::Tunnels => {}
            InfoKind::Peer(p) => out.put_slice(&p.0),
            InfoKind::Tunnel(t) => out.put_u64(t.0),
            InfoKind::Channel(t, c) => {
                out.put_u64(t.0);
                out.put_u32(c.0);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, std::io::Error> {
        if buf.remaining() < 1 {
            return Err(framing_error("truncated info kind"));
        }
        Ok(match buf.get_u8() {
            0 => InfoKind::Peers,
            1 => {
                require(buf, 32)?;
                let mut id = [0u8; 32];
                buf.copy_to_slice(&mut id);
                InfoKind::Peer(PeerId(id))
            }
            2 => InfoKind::Tunnels,
            3 => {
                require(buf, 8)?;
                InfoKind::Tunnel(TunnelId(buf.get_u64()))
            }
            4 => {
                require(buf, 12)?;
                let tunnel = TunnelId(buf.get_u64());
                let ctn = Ctn(buf.get_u32());
                InfoKind::Channel(tunnel, ctn)
            }
            _ => return Err(framing_error("unknown info kind")),
        })
    }
}

/// One message of the client-service local wire protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalMessage {
    PortOpen { port_hash: [u8; 32] },
    PortClose { port_hash: [u8; 32] },
    ChannelCreate {
        local_id: u32,
        peer: PeerId,
        port_hash: [u8; 32],
        options: ChannelOptions,
    },
    ChannelCreateAck { local_id: u32 },
    ChannelCreateNack { local_id: u32 },
    ChannelDestroy { local_id: u32 },
    /// Service-to-client notification that a peer opened a channel on
    /// one of our registered ports; the client answers with
    /// `ChannelCreateAck`/`ChannelCreateNack` based on its port table.
    ChannelIncoming {
        local_id: u32,
        peer: PeerId,
        port_hash: [u8; 32],
        options: ChannelOptions,
    },
    LocalData { local_id: u32, payload: Bytes },
    LocalAck { local_id: u32 },
    InfoRequest { kind: InfoKind },
    /// One row of a monitoring reply; `InfoReplyEnd` is the `NULL`
    /// sentinel terminating the list (spec §4.5).
    InfoReply { kind: InfoKind, payload: Bytes },
    InfoReplyEnd { kind: InfoKind },
}

fn framing_error(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn require(buf: &Bytes, n: usize) -> Result<(), std::io::Error> {
    if buf.remaining() < n {
        Err(framing_error("truncated local-wire message"))
    } else {
        Ok(())
    }
}

fn opts_flags(o: ChannelOptions) -> u32 {
    (o.reliable as u32) | ((o.unbuffered as u32) << 1) | ((o.out_of_order as u32) << 2)
}

fn opts_from_flags(f: u32) -> ChannelOptions {
    ChannelOptions {
        reliable: f & 0x1 != 0,
        unbuffered: f & 0x2 != 0,
        out_of_order: f & 0x4 != 0,
    }
}

impl LocalMessage {
    fn frame_type(&self) -> LocalFrameType {
        use LocalMessage::*;
        match self {
            PortOpen { .. } => LocalFrameType::PortOpen,
            PortClose { .. } => LocalFrameType::PortClose,
            ChannelCreate { .. } => LocalFrameType::ChannelCreate,
            ChannelCreateAck { .. } => LocalFrameType::ChannelCreateAck,
            ChannelCreateNack { .. } => LocalFrameType::ChannelCreateNack,
            ChannelDestroy { .. } => LocalFrameType::ChannelDestroy,
            ChannelIncoming { .. } => LocalFrameType::ChannelIncoming,
            LocalData { .. } => LocalFrameType::LocalData,
            LocalAck { .. } => LocalFrameType::LocalAck,
            InfoRequest { .. } => LocalFrameType::InfoRequest,
            InfoReply { .. } => LocalFrameType::InfoReply,
            InfoReplyEnd { .. } => LocalFrameType::InfoReplyEnd,
        }
    }

    fn encode_body(&self, out: &mut BytesMut) {
        use LocalMessage::*;
        match self {
            PortOpen { port_hash } | PortClose { port_hash } => out.put_slice(port_hash),
            ChannelCreate {
                local_id,
                peer,
                port_hash,
                options,
            } => {
                out.put_u32(*local_id);
                out.put_slice(&peer.0);
                out.put_slice(port_hash);
                out.put_u32(opts_flags(*options));
            }
            ChannelCreateAck { local_id } | ChannelCreateNack { local_id } | ChannelDestroy { local_id } | LocalAck { local_id } => {
                out.put_u32(*local_id);
            }
            ChannelIncoming {
                local_id,
                peer,
                port_hash,
                options,
            } => {
                out.put_u32(*local_id);
                out.put_slice(&peer.0);
                out.put_slice(port_hash);
                out.put_u32(opts_flags(*options));
            }
            LocalData { local_id, payload } => {
                out.put_u32(*local_id);
                out.put_slice(payload);
            }
            InfoRequest { kind } | InfoReplyEnd { kind } => kind.encode_onto(out),
            InfoReply { kind, payload } => {
                kind.encode_onto(out);
                out.put_slice(payload);
            }
        }
    }
}

/// `asynchronous_codec` wrapper for [`LocalMessage`], the CADET local-wire
/// analogue of the teacher's `tor_proto::channel::codec::ChannelCodec`.
#[derive(Default)]
pub struct LocalCodec;

impl Encoder for LocalCodec {
    type Item = LocalMessage;
    type Error = std::io::Error;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode_body(&mut body);
        let total_len = 4 + body.len();
        if total_len > MAX_LOCAL_MESSAGE_SIZE {
            return Err(framing_error("local message too large to encode"));
        }
        dst.put_u16(total_len as u16);
        dst.put_u16(item.frame_type() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for LocalCodec {
    type Item = LocalMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let total_len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if total_len < 4 || total_len > MAX_LOCAL_MESSAGE_SIZE {
            return Err(framing_error("declared frame length out of range"));
        }
        if src.len() < total_len {
            return Ok(None);
        }
        let frame = src.split_to(total_len).freeze();
        let mut buf = frame;
        buf.advance(2);
        let frame_type = LocalFrameType::try_from(buf.get_u16())?;
        let msg = match frame_type {
            LocalFrameType::PortOpen => {
                require(&buf, 32)?;
                let mut h = [0u8; 32];
                buf.copy_to_slice(&mut h);
                LocalMessage::PortOpen { port_hash: h }
            }
            LocalFrameType::PortClose => {
                require(&buf, 32)?;
                let mut h = [0u8; 32];
                buf.copy_to_slice(&mut h);
                LocalMessage::PortClose { port_hash: h }
            }
            LocalFrameType::ChannelCreate => {
                require(&buf, 4 + 32 + 32 + 4)?;
                let local_id = buf.get_u32();
                let mut peer = [0u8; 32];
                buf.copy_to_slice(&mut peer);
                let mut port_hash = [0u8; 32];
                buf.copy_to_slice(&mut port_hash);
                let options = opts_from_flags(buf.get_u32());
                LocalMessage::ChannelCreate {
                    local_id,
                    peer: PeerId(peer),
                    port_hash,
                    options,
                }
            }
            LocalFrameType::ChannelCreateAck => {
                require(&buf, 4)?;
                LocalMessage::ChannelCreateAck { local_id: buf.get_u32() }
            }
            LocalFrameType::ChannelCreateNack => {
                require(&buf, 4)?;
                LocalMessage::ChannelCreateNack { local_id: buf.get_u32() }
            }
            LocalFrameType::ChannelDestroy => {
                require(&buf, 4)?;
                LocalMessage::ChannelDestroy { local_id: buf.get_u32() }
            }
            LocalFrameType::LocalData => {
                require(&buf, 4)?;
                let local_id = buf.get_u32();
                let payload = buf.copy_to_bytes(buf.remaining());
                LocalMessage::LocalData { local_id, payload }
            }
            LocalFrameType::LocalAck => {
                require(&buf, 4)?;
                LocalMessage::LocalAck { local_id: buf.get_u32() }
            }
            LocalFrameType::InfoRequest => LocalMessage::InfoRequest {
                kind: InfoKind::decode(&mut buf)?,
            },
            LocalFrameType::InfoReply => {
                let kind = InfoKind::decode(&mut buf)?;
                let payload = buf.copy_to_bytes(buf.remaining());
                LocalMessage::InfoReply { kind, payload }
            }
            LocalFrameType::InfoReplyEnd => LocalMessage::InfoReplyEnd {
                kind: InfoKind::decode(&mut buf)?,
            },
            LocalFrameType::ChannelIncoming => {
                require(&buf, 4 + 32 + 32 + 4)?;
                let local_id = buf.get_u32();
                let mut peer = [0u8; 32];
                buf.copy_to_slice(&mut peer);
                let mut port_hash = [0u8; 32];
                buf.copy_to_slice(&mut port_hash);
                let options = opts_from_flags(buf.get_u32());
                LocalMessage::ChannelIncoming {
                    local_id,
                    peer: PeerId(peer),
                    port_hash,
                    options,
                }
            }
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_create_round_trips() {
        let msg = LocalMessage::ChannelCreate {
            local_id: 9,
            peer: PeerId([3u8; 32]),
            port_hash: [4u8; 32],
            options: ChannelOptions {
                reliable: true,
                unbuffered: false,
                out_of_order: true,
            },
        };
        let mut codec = LocalCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none() {
        let msg = LocalMessage::LocalAck { local_id: 1 };
        let mut codec = LocalCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn info_request_peer_round_trips() {
        let msg = LocalMessage::InfoRequest {
            kind: InfoKind::Peer(PeerId([7u8; 32])),
        };
        let mut codec = LocalCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
