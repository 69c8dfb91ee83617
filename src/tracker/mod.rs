//! Tracker aggregation.
//!
//! A torrent names zero or more tracker URLs (`announce`/`announce-list`,
//! BEP 12). The aggregator fans an announce request out to every one of
//! them in parallel, via whichever of [`http`] or [`udp`] matches the
//! URL's scheme, and unions the peer endpoints each successful response
//! carries into a single set. Per-tracker failures are logged and
//! swallowed; the aggregate only fails when every tracker failed.

mod http;
mod udp;

use std::collections::HashSet;

use futures::future::join_all;
use url::Url;

use crate::{error::*, PeerEndpoint, PeerId, Sha1Hash};

use http::HttpTracker;
use udp::UdpTracker;

/// The fields common to both the HTTP and UDP announce requests.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// The fields of a tracker response this core cares about: the peer
/// addresses, and (for informational purposes only) the suggested
/// announce interval.
#[derive(Debug)]
pub(crate) struct TrackerResponse {
    pub interval: Option<u32>,
    pub peers: Vec<PeerEndpoint>,
}

/// Fans an announce out across every tracker URL a torrent names and
/// unions the resulting peer endpoints.
pub(crate) struct TrackerAggregator {
    urls: Vec<Url>,
    udp_max_retries: usize,
}

impl TrackerAggregator {
    /// Builds an aggregator from a flattened list of tracker URL strings
    /// (the caller has already applied BEP 12 announce/announce-list
    /// precedence — see [`crate::metainfo::Metainfo::tracker_urls`]).
    /// URLs that fail to parse are dropped with a warning rather than
    /// failing construction, since one malformed tracker shouldn't sink
    /// the whole torrent.
    pub fn new(urls: &[String], udp_max_retries: usize) -> Self {
        let urls = urls
            .iter()
            .filter_map(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    log::warn!("skipping unparseable tracker url {}: {}", raw, e);
                    None
                }
            })
            .collect();
        Self {
            urls,
            udp_max_retries,
        }
    }

    /// Announces `req` to every tracker URL concurrently and returns the
    /// union of all peer endpoints obtained. Fails with [`Error::NoPeers`]
    /// only when every tracker failed.
    pub async fn announce_all(
        &self,
        req: AnnounceRequest,
    ) -> Result<HashSet<PeerEndpoint>> {
        if self.urls.is_empty() {
            return Err(Error::NoPeers);
        }

        let futures = self.urls.iter().map(|url| {
            let req = req.clone();
            let url = url.clone();
            let max_retries = self.udp_max_retries;
            async move { (url.clone(), announce_one(&url, &req, max_retries).await) }
        });
        let results = join_all(futures).await;

        let mut peers = HashSet::new();
        let mut any_succeeded = false;
        for (url, result) in results {
            match result {
                Ok(resp) => {
                    any_succeeded = true;
                    log::debug!(
                        "tracker {} returned {} peer(s)",
                        url,
                        resp.peers.len()
                    );
                    peers.extend(resp.peers);
                }
                Err(e) => {
                    log::warn!("tracker {} failed: {}", url, e);
                }
            }
        }

        if !any_succeeded {
            return Err(Error::NoPeers);
        }

        Ok(peers)
    }
}

/// Dispatches a single announce to whichever tracker client matches the
/// URL's scheme.
async fn announce_one(
    url: &Url,
    req: &AnnounceRequest,
    udp_max_retries: usize,
) -> Result<TrackerResponse> {
    match url.scheme() {
        "http" | "https" => HttpTracker::new(url.clone()).announce(req).await,
        "udp" => {
            let mut tracker = UdpTracker::new(url, udp_max_retries).await?;
            tracker.announce(req).await
        }
        other => Err(Error::TrackerFailure(format!(
            "unsupported tracker scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_without_sinking_others() {
        let aggregator = TrackerAggregator::new(
            &["ftp://example.com/announce".to_string()],
            3,
        );
        let result = aggregator.announce_all(sample_request()).await;
        assert!(matches!(result, Err(Error::NoPeers)));
    }

    #[test]
    fn unparseable_urls_are_dropped_not_fatal() {
        let aggregator = TrackerAggregator::new(
            &["not a url".to_string(), "http://example.com/announce".to_string()],
            3,
        );
        assert_eq!(aggregator.urls.len(), 1);
    }

    #[tokio::test]
    async fn empty_tracker_list_fails_with_no_peers() {
        let aggregator = TrackerAggregator::new(&[], 3);
        let result = aggregator.announce_all(sample_request()).await;
        assert!(matches!(result, Err(Error::NoPeers)));
    }
}
