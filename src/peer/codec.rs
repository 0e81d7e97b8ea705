//! Wire-level framing for the BitTorrent peer protocol: the handshake and
//! the length-prefixed message stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

#[derive(Clone, Copy, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub(crate) fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        let len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(len);
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[..prot_len]);
        buf.advance(prot_len);

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte identifying a message on the wire, per the base protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_byte(byte: u8) -> Result<Self, Error> {
        Ok(match byte {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => return Err(Error::UnexpectedMessage("unknown message id")),
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub(crate) fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = MessageId::from_byte(buf[0])?;
        let mut payload = buf.split_to(len);
        payload.advance(1);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                let piece_index = payload.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = payload.to_vec();
                Message::Bitfield(crate::Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                let len = payload.get_u32();
                Message::Request(BlockInfo { piece_index, offset, len })
            }
            MessageId::Block => {
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                let data = payload.to_vec();
                Message::Block { piece_index, offset, data }
            }
            MessageId::Cancel => {
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                let len = payload.get_u32();
                Message::Cancel(BlockInfo { piece_index, offset, len })
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([3; 20], [7; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [3; 20]);
        assert_eq!(decoded.peer_id, [7; 20]);
    }

    #[test]
    fn request_round_trips() {
        let mut codec = PeerCodec;
        let block = BlockInfo { piece_index: 4, offset: 16384, len: 16384 };
        let mut buf = BytesMut::new();
        codec.encode(Message::Request(block), &mut buf).unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Request(decoded) => assert_eq!(decoded, block),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        ));
    }
}
