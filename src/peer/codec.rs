//! The peer wire codec: the fixed 68-byte handshake frame and the
//! length-prefixed peer message frames, as two separate
//! [`tokio_util::codec`] `Encoder`/`Decoder` pairs, mirroring how a real
//! session switches codecs after the handshake (see
//! [`super::PeerSession::connect`]).

use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";
const PSTRLEN: u8 = PROTOCOL_STRING.len() as u8;
const RESERVED_LEN: usize = 8;

/// The 68-byte frame that opens every peer TCP session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(1 + PSTRLEN as usize + RESERVED_LEN + 20 + 20);
        buf.put_u8(PSTRLEN);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; RESERVED_LEN]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let pstrlen = buf[0] as usize;
        if pstrlen == 0 {
            return Err(Error::MalformedFrame(
                "handshake pstrlen must not be zero".into(),
            ));
        }

        let total_len = 1 + pstrlen + RESERVED_LEN + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(1 + pstrlen + RESERVED_LEN);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&frame[..20]);
        frame.advance(20);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&frame[..20]);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// The 1-byte message type tag that follows a nonzero length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            other => {
                return Err(Error::MalformedFrame(format!(
                    "unknown message id {}",
                    other
                )))
            }
        })
    }
}

/// A decoded peer message. `KeepAlive` is the zero-length sentinel (no id,
/// no payload); every other variant corresponds to one [`MessageId`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
}

/// A per-implementation sanity bound on the declared frame length, well
/// above the largest legitimate frame (a `piece` message: 9 bytes of
/// header plus a single `BLOCK_LEN` block).
pub(crate) const MAX_MESSAGE_LEN: u32 = 1 << 17;

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
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
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                encode_block_request(MessageId::Request, block, buf)?;
            }
            Message::Piece {
                piece_index,
                begin,
                block,
            } => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(begin);
                buf.put_slice(&block);
            }
            Message::Cancel(block) => {
                encode_block_request(MessageId::Cancel, block, buf)?;
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

/// `request` and `cancel` share the same `index, begin, length` shape.
/// `length` must be in `1..=BLOCK_LEN`; this is the one constructor site
/// that must reject out-of-range lengths before they hit the wire.
fn encode_block_request(
    id: MessageId,
    block: BlockInfo,
    buf: &mut BytesMut,
) -> Result<()> {
    if block.len == 0 || block.len > BLOCK_LEN {
        return Err(Error::MalformedFrame(format!(
            "request length {} out of range",
            block.len
        )));
    }
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
    Ok(())
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame length {} exceeds sanity bound",
                len
            )));
        }

        let total_len = 4 + len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(4);
        let id = MessageId::from_u8(frame[0])?;
        frame.advance(1);
        let payload = &frame[..];

        let msg = match id {
            MessageId::Choke => {
                require_payload_len(payload.len(), 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                require_payload_len(payload.len(), 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                require_payload_len(payload.len(), 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                require_payload_len(payload.len(), 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                require_payload_len(payload.len(), 4)?;
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                Message::Have(index as PieceIndex)
            }
            MessageId::Bitfield => Message::Bitfield(payload.to_vec()),
            MessageId::Request => {
                require_payload_len(payload.len(), 12)?;
                Message::Request(decode_block_info(payload)?)
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::MalformedFrame(
                        "piece payload shorter than index+begin".into(),
                    ));
                }
                let piece_index =
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let block = payload[8..].to_vec();
                Message::Piece {
                    piece_index,
                    begin,
                    block,
                }
            }
            MessageId::Cancel => {
                require_payload_len(payload.len(), 12)?;
                Message::Cancel(decode_block_info(payload)?)
            }
            MessageId::Port => {
                require_payload_len(payload.len(), 2)?;
                let port = u16::from_be_bytes(payload[0..2].try_into().unwrap());
                Message::Port(port)
            }
        };

        Ok(Some(msg))
    }
}

fn require_payload_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::MalformedFrame(format!(
            "expected a {} byte payload, got {}",
            expected, actual
        )));
    }
    Ok(())
}

fn decode_block_info(payload: &[u8]) -> Result<BlockInfo> {
    let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
    let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    if len == 0 || len > BLOCK_LEN {
        return Err(Error::MalformedFrame(format!(
            "request length {} out of range",
            len
        )));
    }
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Handshake frame layout and round-trip.
    #[test]
    fn handshake_round_trip() {
        let mut peer_id = [0u8; 20];
        let mut info_hash = [0u8; 20];
        for i in 0..20 {
            peer_id[i] = i as u8;
            info_hash[i] = i as u8;
        }
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 0x13);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &info_hash[..]);
        assert_eq!(&buf[48..68], &peer_id[..]);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_zero_pstrlen() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x13);
        buf.put_slice(b"short");
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn have_message_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Have(1), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x01]
        );

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Have(1));
    }

    #[test]
    fn zero_length_decodes_to_keep_alive() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn no_payload_messages_round_trip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
            assert_eq!(PeerCodec.decode(&mut buf).unwrap().unwrap(), msg);
        }
    }

    #[test]
    fn request_round_trip() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Request(block)
        );
    }

    #[test]
    fn request_rejects_zero_length() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 0,
        };
        let mut buf = BytesMut::new();
        assert!(PeerCodec.encode(Message::Request(block), &mut buf).is_err());
    }

    #[test]
    fn request_rejects_oversized_length() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN + 1,
        };
        let mut buf = BytesMut::new();
        assert!(PeerCodec.encode(Message::Request(block), &mut buf).is_err());
    }

    #[test]
    fn piece_round_trip() {
        let msg = Message::Piece {
            piece_index: 2,
            begin: 0,
            block: vec![0xAB; 1024],
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(PeerCodec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn bitfield_round_trip() {
        let msg = Message::Bitfield(vec![0x80, 0x00]);
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(PeerCodec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn truncated_frame_awaits_more_bytes() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have(7), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn oversized_declared_length_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn unknown_message_id_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn wrong_payload_length_is_malformed() {
        let mut buf = BytesMut::new();
        // choke with an extra stray byte
        buf.put_u32(2);
        buf.put_u8(MessageId::Choke as u8);
        buf.put_u8(0);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
