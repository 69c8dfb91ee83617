//! The crate-wide error type and result alias.
//!
//! Per the propagation policy: peer-local failures (connect, handshake,
//! protocol violations, timeouts, hash mismatches) never leave the peer or
//! scheduler layer as an `Err` — they drive a requeue and, where
//! appropriate, a worker exit. Only [`Error::DownloadStalled`] and
//! [`Error::DiskWriteFailed`] are surfaced from the scheduler, and only
//! [`Error::NoPeers`] is surfaced from the tracker layer.

use std::{fmt, io};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The metadata record is structurally invalid (e.g. no pieces, file
    /// lengths that don't sum to the declared total).
    MetadataInvalid(String),
    /// A single tracker URL failed to produce a response.
    TrackerFailure(String),
    /// A single tracker URL timed out.
    TrackerTimeout(String),
    /// Every tracker failed; no peers could be obtained.
    NoPeers,
    /// Could not establish a TCP connection to a peer.
    PeerConnectFailed,
    /// The peer's handshake advertised a different info hash.
    HandshakeMismatch,
    /// The peer sent a frame that violates the wire protocol.
    PeerProtocolError(String),
    /// A read or write deadline elapsed.
    PeerTimeout,
    /// A completed piece's SHA-1 didn't match its expected hash.
    PieceHashMismatch,
    /// The frame itself could not be parsed off the wire.
    MalformedFrame(String),
    /// No piece completed within the idle window while pieces remain.
    DownloadStalled,
    /// A write to the file sink failed unrecoverably.
    DiskWriteFailed(String),
    /// Invalid piece index for this torrent's storage layout.
    InvalidPieceIndex,
    Io(io::Error),
    Bencode(serde_bencode::Error),
    Http(reqwest::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MetadataInvalid(msg) => write!(f, "invalid metadata: {}", msg),
            Error::TrackerFailure(url) => write!(f, "tracker {} failed", url),
            Error::TrackerTimeout(url) => write!(f, "tracker {} timed out", url),
            Error::NoPeers => write!(f, "no peers: all trackers failed"),
            Error::PeerConnectFailed => write!(f, "failed to connect to peer"),
            Error::HandshakeMismatch => write!(f, "peer handshake info hash mismatch"),
            Error::PeerProtocolError(msg) => write!(f, "peer protocol error: {}", msg),
            Error::PeerTimeout => write!(f, "peer read/write timed out"),
            Error::PieceHashMismatch => write!(f, "piece failed integrity check"),
            Error::MalformedFrame(msg) => write!(f, "malformed wire frame: {}", msg),
            Error::DownloadStalled => write!(f, "download stalled: idle timeout elapsed"),
            Error::DiskWriteFailed(msg) => write!(f, "disk write failed: {}", msg),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Http(e) => write!(f, "http error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Error::PeerTimeout
    }
}
