//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The 8-byte Azureus-style client identifier prefix this crate announces
/// itself with: client code `lc`, version `0001`.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-lc0001-";

/// Generates a fresh peer id: [`CLIENT_ID_PREFIX`] followed by 12 random
/// bytes, per the recommendation in BEP 20.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. Generates a fresh random peer id for [`EngineConf::client_id`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The maximum number of outstanding block requests a peer session keeps
    /// pipelined at once.
    pub max_in_flight_requests: usize,

    /// The number of consecutive read timeouts a peer session tolerates
    /// before closing the connection.
    pub max_consecutive_timeouts: usize,

    /// How long the scheduler waits for a piece to complete before
    /// considering the download stalled.
    pub idle_timeout: Duration,

    /// The total liveness budget for a single piece task.
    pub piece_timeout: Duration,

    /// Per-message read deadline on a peer connection.
    pub read_timeout: Duration,

    /// Per-message write deadline on a peer connection.
    pub write_timeout: Duration,

    /// Deadline for establishing a TCP connection to a peer.
    pub dial_timeout: Duration,

    /// The number of retries the UDP tracker client attempts for each step
    /// of the connect/announce handshake before giving up on that tracker.
    pub udp_tracker_max_retries: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            max_in_flight_requests: 5,
            max_consecutive_timeouts: 8,
            idle_timeout: Duration::from_secs(30),
            piece_timeout: Duration::from_secs(25),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(5),
            udp_tracker_max_retries: 3,
        }
    }
}
