//! A single peer TCP session: handshake, message loop, choke/interest
//! state, and the pipelined block-request discipline used to fetch one
//! piece at a time on behalf of the piece scheduler.

mod codec;

use std::{net::SocketAddr, time::Duration, time::Instant};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield, conf::TorrentConf, error::*, Bitfield, BlockInfo, PeerId, PieceIndex, PieceTask,
    Sha1Hash, BLOCK_LEN,
};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// The lifecycle of a peer session. Tracked mainly for logging; the
/// behavior that matters (request gating, timeouts) lives in the
/// `remote_choked_us`/`consecutive_timeouts` fields below rather than
/// being re-derived from this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Active,
}

/// A live connection to one peer. Owned exclusively by the worker task
/// that created it (see [`crate::scheduler`]); destroyed on disconnect.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    socket: Framed<TcpStream, PeerCodec>,
    state: SessionState,
    /// Whether the remote peer has us choked (starts `true`).
    remote_choked_us: bool,
    /// Whether we've told the remote peer we're interested.
    we_are_interested: bool,
    /// The pieces the remote peer claims to have.
    remote_bitfield: Bitfield,
    #[allow(dead_code)]
    remote_peer_id: PeerId,
    /// Consecutive read timeouts, bounded by `conf.max_consecutive_timeouts`.
    consecutive_timeouts: usize,
}

impl PeerSession {
    /// Dials `addr`, performs the handshake, and folds in any
    /// `bitfield`/`have` messages the peer sends immediately afterwards.
    /// On return the session has already sent `unchoke` then `interested`.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: PeerId,
        piece_count: usize,
        conf: &TorrentConf,
    ) -> Result<Self> {
        log::info!("peer {} session state: {:?}", addr, SessionState::Connecting);
        let tcp = time::timeout(conf.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::PeerConnectFailed)?
            .map_err(|_| Error::PeerConnectFailed)?;

        log::info!("peer {} session state: {:?}", addr, SessionState::Handshaking);
        let mut handshake_socket = Framed::new(tcp, HandshakeCodec);

        let handshake = Handshake::new(info_hash, our_peer_id);
        time::timeout(conf.write_timeout, handshake_socket.send(handshake))
            .await
            .map_err(|_| Error::PeerTimeout)??;

        log::debug!("waiting for peer {} handshake", addr);
        let peer_handshake = time::timeout(conf.read_timeout, handshake_socket.next())
            .await
            .map_err(|_| Error::PeerTimeout)?
            .ok_or(Error::PeerConnectFailed)??;

        if peer_handshake.info_hash != info_hash {
            log::warn!("peer {} handshake info hash mismatch", addr);
            return Err(Error::HandshakeMismatch);
        }
        let remote_peer_id = peer_handshake.peer_id;
        log::info!("peer {} handshake complete", addr);

        // Switch from the handshake codec to the message codec, carrying
        // over any bytes the peer already sent after its handshake.
        let old_parts = handshake_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let mut session = Self {
            addr,
            socket,
            state: SessionState::Established,
            remote_choked_us: true,
            we_are_interested: false,
            remote_bitfield: bitfield::new(piece_count),
            remote_peer_id,
            consecutive_timeouts: 0,
        };

        session.drain_availability_messages(conf).await?;

        session.send_now(Message::Unchoke, conf).await?;
        session.send_now(Message::Interested, conf).await?;
        session.we_are_interested = true;
        session.state = SessionState::Active;

        Ok(session)
    }

    /// Gives the peer a short grace window to send its initial
    /// `bitfield`/`have` burst before we start issuing requests. Messages
    /// that aren't availability-related are applied the same way they
    /// would be mid-download (choke/unchoke/keep-alive); anything
    /// upload-only (`request`/`interested`/etc.) is logged and ignored,
    /// since this core never seeds.
    async fn drain_availability_messages(&mut self, conf: &TorrentConf) -> Result<()> {
        const GRACE: Duration = Duration::from_millis(200);
        loop {
            match time::timeout(GRACE, self.socket.next()).await {
                Ok(Some(Ok(msg))) => self.apply_message(&msg),
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Err(Error::PeerConnectFailed),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Returns whether the remote peer claims to have `index`.
    pub fn has(&self, index: PieceIndex) -> bool {
        bitfield::has(&self.remote_bitfield, index)
    }

    /// Fetches one piece from this peer: pipelines up to
    /// `conf.max_in_flight_requests` outstanding `request`s, copies
    /// arriving `piece` blocks into a buffer, and returns once every byte
    /// has arrived or the per-task deadline (`conf.piece_timeout`)
    /// elapses. Does not verify the hash — the caller (the scheduler's
    /// worker loop) does that.
    pub async fn fetch_piece(&mut self, task: &PieceTask, conf: &TorrentConf) -> Result<Vec<u8>> {
        self.state = SessionState::Active;
        let deadline = Instant::now() + conf.piece_timeout;
        let mut buffer = vec![0u8; task.len as usize];
        let mut downloaded: u32 = 0;
        let mut requested: u32 = 0;
        let mut in_flight: usize = 0;

        while downloaded < task.len {
            while !self.remote_choked_us
                && in_flight < conf.max_in_flight_requests
                && requested < task.len
            {
                let len = std::cmp::min(BLOCK_LEN, task.len - requested);
                let block = BlockInfo {
                    piece_index: task.index,
                    offset: requested,
                    len,
                };
                self.send_now(Message::Request(block), conf).await?;
                requested += len;
                in_flight += 1;
            }

            let remaining = deadline.checked_duration_since(Instant::now());
            let remaining = match remaining {
                Some(d) if !d.is_zero() => d,
                _ => return Err(Error::PeerTimeout),
            };
            let read_deadline = remaining.min(conf.read_timeout);

            match time::timeout(read_deadline, self.socket.next()).await {
                Ok(Some(Ok(msg))) => {
                    self.consecutive_timeouts = 0;
                    match msg {
                        Message::Piece {
                            piece_index,
                            begin,
                            block,
                        } => {
                            if piece_index != task.index {
                                log::warn!(
                                    "peer {} sent block for piece {}, expected {}",
                                    self.addr,
                                    piece_index,
                                    task.index
                                );
                                continue;
                            }
                            let begin = begin as usize;
                            let end = begin.saturating_add(block.len());
                            if end > buffer.len() {
                                log::warn!(
                                    "peer {} sent out-of-range block begin={} len={}",
                                    self.addr,
                                    begin,
                                    block.len()
                                );
                                continue;
                            }
                            buffer[begin..end].copy_from_slice(&block);
                            downloaded += block.len() as u32;
                            in_flight = in_flight.saturating_sub(1);
                        }
                        Message::Choke => {
                            self.remote_choked_us = true;
                            // the Fast extension isn't supported, so any
                            // outstanding requests won't be served
                            in_flight = 0;
                        }
                        other => self.apply_message(&other),
                    }
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Err(Error::PeerConnectFailed),
                Err(_) => {
                    self.consecutive_timeouts += 1;
                    log::debug!(
                        "peer {} read timed out ({} consecutive)",
                        self.addr,
                        self.consecutive_timeouts
                    );
                    if self.consecutive_timeouts >= conf.max_consecutive_timeouts {
                        return Err(Error::PeerTimeout);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::PeerTimeout);
            }
        }

        Ok(buffer)
    }

    /// Sends an advisory `have` announcing a just-completed piece.
    pub async fn send_have(&mut self, index: PieceIndex, conf: &TorrentConf) -> Result<()> {
        self.send_now(Message::Have(index), conf).await
    }

    /// Applies the state-affecting subset of messages
    /// (choke/unchoke/have/bitfield/keep-alive) without otherwise acting
    /// on them. Used both during the post-handshake grace window and
    /// in-between blocks of an active piece fetch.
    fn apply_message(&mut self, msg: &Message) {
        match msg {
            Message::Choke => {
                self.remote_choked_us = true;
            }
            Message::Unchoke => {
                self.remote_choked_us = false;
            }
            Message::Have(index) => {
                bitfield::set(&mut self.remote_bitfield, *index);
            }
            Message::Bitfield(bytes) => {
                self.remote_bitfield = bitfield::decode(bytes, self.remote_bitfield.len());
            }
            Message::KeepAlive => {}
            other => {
                log::debug!("peer {} sent unhandled message: {:?}", self.addr, other);
            }
        }
    }

    async fn send_now(&mut self, msg: Message, conf: &TorrentConf) -> Result<()> {
        time::timeout(conf.write_timeout, self.socket.send(msg))
            .await
            .map_err(|_| Error::PeerTimeout)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Short timeouts so a hung test fails fast rather than the default
    /// production deadlines (30s read, 25s per-piece, etc).
    fn test_conf() -> TorrentConf {
        let mut conf = TorrentConf::new(std::env::temp_dir());
        conf.dial_timeout = Duration::from_millis(500);
        conf.read_timeout = Duration::from_millis(500);
        conf.write_timeout = Duration::from_millis(500);
        conf.piece_timeout = Duration::from_millis(500);
        conf
    }

    /// Plays the remote side of the handshake over an already-accepted
    /// socket, then switches to the message codec exactly as
    /// [`PeerSession::connect`] does, so the rest of a test can exchange
    /// [`Message`]s with the session under test.
    async fn accept_handshake(
        listener: &TcpListener,
        info_hash: Sha1Hash,
        remote_peer_id: PeerId,
    ) -> Framed<TcpStream, PeerCodec> {
        let (socket, _) = listener.accept().await.unwrap();
        let mut handshake_socket = Framed::new(socket, HandshakeCodec);

        let their_handshake = handshake_socket.next().await.unwrap().unwrap();
        assert_eq!(their_handshake.info_hash, info_hash);

        handshake_socket
            .send(Handshake::new(info_hash, remote_peer_id))
            .await
            .unwrap();

        let old_parts = handshake_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Framed::from_parts(new_parts)
    }

    #[tokio::test]
    async fn connect_completes_handshake_and_announces_interest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let our_peer_id = [1u8; 20];

        let fake_peer = tokio::spawn(async move {
            let mut socket = accept_handshake(&listener, info_hash, [9u8; 20]).await;
            // the 200ms availability-exchange grace window passes with
            // nothing sent from here; the session must then announce
            // itself with unchoke followed by interested.
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Unchoke);
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Interested);
        });

        let conf = test_conf();
        let session = PeerSession::connect(addr, info_hash, our_peer_id, 1, &conf)
            .await
            .unwrap();
        assert!(session.we_are_interested);
        assert!(session.remote_choked_us, "a fresh session starts choked");

        fake_peer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let mismatched_info_hash = [8u8; 20];

        let fake_peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut handshake_socket = Framed::new(socket, HandshakeCodec);
            handshake_socket.next().await.unwrap().unwrap();
            handshake_socket
                .send(Handshake::new(mismatched_info_hash, [9u8; 20]))
                .await
                .unwrap();
        });

        let conf = test_conf();
        let result = PeerSession::connect(addr, info_hash, [1u8; 20], 1, &conf).await;
        assert!(matches!(result, Err(Error::HandshakeMismatch)));

        fake_peer.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_piece_waits_out_choke_then_pipelines_and_assembles_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let our_peer_id = [1u8; 20];
        let piece_len = 3 * BLOCK_LEN;

        let fake_peer = tokio::spawn(async move {
            let mut socket = accept_handshake(&listener, info_hash, [9u8; 20]).await;
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Unchoke);
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Interested);

            // withhold unchoke briefly: the session must not send any
            // requests while it still believes itself choked.
            time::delay_for(Duration::from_millis(50)).await;
            socket.send(Message::Unchoke).await.unwrap();

            // exactly one pipelined request per block should arrive, all
            // before any response is sent back.
            let mut requests = Vec::new();
            for _ in 0..3 {
                match socket.next().await.unwrap().unwrap() {
                    Message::Request(block) => requests.push(block),
                    other => panic!("expected a request, got {:?}", other),
                }
            }
            assert_eq!(requests.len(), 3);
            requests.sort_by_key(|b| b.offset);

            // answer out of order (last block first) to exercise
            // offset-addressed assembly rather than in-order writes.
            for block in requests.into_iter().rev() {
                let fill = (block.offset / BLOCK_LEN) as u8;
                socket
                    .send(Message::Piece {
                        piece_index: block.piece_index,
                        begin: block.offset,
                        block: vec![fill; block.len as usize],
                    })
                    .await
                    .unwrap();
            }
        });

        let conf = test_conf();
        let mut session = PeerSession::connect(addr, info_hash, our_peer_id, 1, &conf)
            .await
            .unwrap();

        let task = PieceTask {
            index: 0,
            expected_hash: [0u8; 20],
            len: piece_len,
        };
        let bytes = session.fetch_piece(&task, &conf).await.unwrap();

        assert_eq!(bytes.len(), piece_len as usize);
        for (i, chunk) in bytes.chunks(BLOCK_LEN as usize).enumerate() {
            assert!(
                chunk.iter().all(|b| *b == i as u8),
                "block {} not placed at its own offset",
                i
            );
        }

        fake_peer.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_piece_rejects_response_for_a_different_piece_index() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let our_peer_id = [1u8; 20];

        let fake_peer = tokio::spawn(async move {
            let mut socket = accept_handshake(&listener, info_hash, [9u8; 20]).await;
            socket.next().await.unwrap().unwrap(); // unchoke
            socket.next().await.unwrap().unwrap(); // interested
            socket.send(Message::Unchoke).await.unwrap();

            let block = match socket.next().await.unwrap().unwrap() {
                Message::Request(block) => block,
                other => panic!("expected a request, got {:?}", other),
            };

            // a stray block for a piece we didn't ask for must be ignored,
            // not corrupt the buffer or end the fetch.
            socket
                .send(Message::Piece {
                    piece_index: block.piece_index + 1,
                    begin: 0,
                    block: vec![0xFF; block.len as usize],
                })
                .await
                .unwrap();
            socket
                .send(Message::Piece {
                    piece_index: block.piece_index,
                    begin: block.offset,
                    block: vec![0xAB; block.len as usize],
                })
                .await
                .unwrap();
        });

        let conf = test_conf();
        let mut session = PeerSession::connect(addr, info_hash, our_peer_id, 1, &conf)
            .await
            .unwrap();

        let task = PieceTask {
            index: 0,
            expected_hash: [0u8; 20],
            len: BLOCK_LEN,
        };
        let bytes = session.fetch_piece(&task, &conf).await.unwrap();

        assert_eq!(bytes, vec![0xAB; BLOCK_LEN as usize]);

        fake_peer.await.unwrap();
    }
}
