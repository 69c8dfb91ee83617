//! UDP tracker client (BEP 15): the two-step connect/announce handshake.

use std::{
    convert::TryInto,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::net::UdpSocket;
use url::Url;

use crate::error::*;

use super::{AnnounceRequest, TrackerResponse};

const PROTOCOL_ID: u64 = 0x41727101980;
const CONNECT_ACTION: u32 = 0;
const ANNOUNCE_ACTION: u32 = 1;
const CONNECT_PACKET_LEN: usize = 16;
const ANNOUNCE_REQ_LEN: usize = 98;
const ANNOUNCE_RESP_HEADER_LEN: usize = 20;
/// A connection id is only valid for this long after it's issued.
const CONN_ID_EXPIRY: Duration = Duration::from_secs(60);

/// A UDP tracker client. Caches the connection id obtained from the
/// connect step across announces, re-connecting once it expires.
pub(crate) struct UdpTracker {
    addr: SocketAddr,
    max_retries: usize,
    conn: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub async fn new(url: &Url, max_retries: usize) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::TrackerFailure(url.to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| Error::TrackerFailure(url.to_string()))?;
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| Error::TrackerFailure(url.to_string()))?
            .next()
            .ok_or_else(|| Error::TrackerFailure(url.to_string()))?;
        Ok(Self {
            addr,
            max_retries,
            conn: None,
        })
    }

    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<TrackerResponse> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(self.addr).await?;

        let conn_id = self.connection_id(&socket).await?;
        let transaction_id: u32 = rand::thread_rng().gen();
        let request = build_announce_request(conn_id, transaction_id, req);

        let resp = self
            .send_and_receive(&socket, &request, ANNOUNCE_RESP_HEADER_LEN)
            .await?;
        parse_announce_response(&resp, transaction_id)
    }

    /// Returns a still-valid connection id, performing the connect step if
    /// none is cached or the cached one has expired.
    async fn connection_id(&mut self, socket: &UdpSocket) -> Result<u64> {
        if let Some((id, issued_at)) = self.conn {
            if issued_at.elapsed() < CONN_ID_EXPIRY {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut request = [0u8; CONNECT_PACKET_LEN];
        request[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
        request[8..12].copy_from_slice(&CONNECT_ACTION.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());

        let resp = self
            .send_and_receive(socket, &request, CONNECT_PACKET_LEN)
            .await?;

        let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
        if action != CONNECT_ACTION {
            return Err(Error::PeerProtocolError(
                "udp tracker: unexpected action in connect response".into(),
            ));
        }
        let resp_transaction_id = u32::from_be_bytes(resp[4..8].try_into().unwrap());
        if resp_transaction_id != transaction_id {
            return Err(Error::PeerProtocolError(
                "udp tracker: transaction id mismatch".into(),
            ));
        }
        let conn_id = u64::from_be_bytes(resp[8..16].try_into().unwrap());
        self.conn = Some((conn_id, Instant::now()));
        Ok(conn_id)
    }

    /// Sends `request` and waits for a response of at least `min_resp_len`
    /// bytes, retrying with exponential backoff (`15 * 2^n` seconds) up to
    /// `self.max_retries` times.
    async fn send_and_receive(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        min_resp_len: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        for attempt in 0..=self.max_retries {
            socket.send(request).await?;
            let timeout = Duration::from_secs(15 * (1 << attempt));
            match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= min_resp_len => return Ok(buf[..n].to_vec()),
                Ok(Ok(n)) => {
                    log::warn!(
                        "udp tracker: short response ({} < {} bytes), retrying",
                        n,
                        min_resp_len
                    );
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    log::debug!("udp tracker: attempt {} timed out", attempt);
                }
            }
        }
        Err(Error::TrackerTimeout(self.addr.to_string()))
    }
}

fn build_announce_request(conn_id: u64, transaction_id: u32, req: &AnnounceRequest) -> Vec<u8> {
    let mut buf = vec![0u8; ANNOUNCE_REQ_LEN];
    buf[0..8].copy_from_slice(&conn_id.to_be_bytes());
    buf[8..12].copy_from_slice(&ANNOUNCE_ACTION.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf[16..36].copy_from_slice(&req.info_hash);
    buf[36..56].copy_from_slice(&req.peer_id);
    buf[56..64].copy_from_slice(&req.downloaded.to_be_bytes());
    buf[64..72].copy_from_slice(&req.left.to_be_bytes());
    buf[72..80].copy_from_slice(&req.uploaded.to_be_bytes());
    buf[80..84].copy_from_slice(&0u32.to_be_bytes()); // event: none
    buf[84..88].copy_from_slice(&0u32.to_be_bytes()); // ip: default
    buf[88..92].copy_from_slice(&0u32.to_be_bytes()); // key: unused
    buf[92..96].copy_from_slice(&0xFFFFFFFFu32.to_be_bytes()); // num_want: default
    buf[96..98].copy_from_slice(&req.port.to_be_bytes());
    buf
}

fn parse_announce_response(resp: &[u8], transaction_id: u32) -> Result<TrackerResponse> {
    if resp.len() < ANNOUNCE_RESP_HEADER_LEN {
        return Err(Error::PeerProtocolError(
            "udp tracker: announce response too short".into(),
        ));
    }
    let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
    if action != ANNOUNCE_ACTION {
        return Err(Error::PeerProtocolError(
            "udp tracker: unexpected action in announce response".into(),
        ));
    }
    let resp_transaction_id = u32::from_be_bytes(resp[4..8].try_into().unwrap());
    if resp_transaction_id != transaction_id {
        return Err(Error::PeerProtocolError(
            "udp tracker: transaction id mismatch".into(),
        ));
    }
    let interval = u32::from_be_bytes(resp[8..12].try_into().unwrap());

    let peers = resp[ANNOUNCE_RESP_HEADER_LEN..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(ip.into(), port)
        })
        .collect();

    Ok(TrackerResponse {
        interval: Some(interval),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the BEP 15 connect request byte layout.
    #[test]
    fn connect_request_layout() {
        let transaction_id = 0xAABBCCDDu32;
        let mut request = [0u8; CONNECT_PACKET_LEN];
        request[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
        request[8..12].copy_from_slice(&CONNECT_ACTION.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());

        assert_eq!(&request[0..8], &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&request[8..12], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn announce_request_layout() {
        let req = AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
        };
        let buf = build_announce_request(42, 7, &req);
        assert_eq!(buf.len(), ANNOUNCE_REQ_LEN);
        assert_eq!(&buf[0..8], &42u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ANNOUNCE_ACTION.to_be_bytes());
        assert_eq!(&buf[12..16], &7u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[1u8; 20][..]);
        assert_eq!(&buf[36..56], &[2u8; 20][..]);
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn announce_response_transaction_mismatch_is_rejected() {
        let mut resp = vec![0u8; ANNOUNCE_RESP_HEADER_LEN];
        resp[0..4].copy_from_slice(&ANNOUNCE_ACTION.to_be_bytes());
        resp[4..8].copy_from_slice(&1u32.to_be_bytes());
        assert!(parse_announce_response(&resp, 2).is_err());
    }

    // Compact peer decoding for the UDP wire form.
    #[test]
    fn announce_response_parses_peers() {
        let mut resp = vec![0u8; ANNOUNCE_RESP_HEADER_LEN];
        resp[0..4].copy_from_slice(&ANNOUNCE_ACTION.to_be_bytes());
        resp[4..8].copy_from_slice(&9u32.to_be_bytes());
        resp.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1]);
        resp.extend_from_slice(&[5, 6, 7, 8, 0x1A, 0xE2]);

        let parsed = parse_announce_response(&resp, 9).unwrap();
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[0], "1.2.3.4:6881".parse().unwrap());
        assert_eq!(parsed.peers[1], "5.6.7.8:6882".parse().unwrap());
    }
}
