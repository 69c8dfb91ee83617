//! HTTP(S) tracker client.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::de;

use crate::error::*;

use super::{AnnounceRequest, TrackerResponse};

/// Percent-encode all non-alphanumeric bytes except `-._~`, preserving the
/// raw 20-byte info_hash and peer_id rather than lossily treating them as
/// UTF-8.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// An HTTP(S) tracker client, announcing via a GET request and parsing the
/// bencoded response body.
pub(crate) struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    pub async fn announce(&self, req: &AnnounceRequest) -> Result<TrackerResponse> {
        let mut url = self.url.clone();
        url.set_query(Some(&build_query(req)));

        log::debug!("Announcing to HTTP tracker {}", self.url);
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let body: Body = serde_bencode::from_bytes(&bytes)?;
        if let Some(reason) = body.failure_reason {
            return Err(Error::TrackerFailure(reason));
        }

        Ok(TrackerResponse {
            interval: body.interval,
            peers: body.peers,
        })
    }
}

/// Builds the raw, already-percent-encoded announce query string.
///
/// `Url::query_pairs_mut().append_pair` percent-encodes its value argument
/// itself (application/x-www-form-urlencoded), so passing it an
/// already-percent-encoded `info_hash`/`peer_id` would re-escape every `%`
/// into `%25` and mangle the raw 20 bytes. This is built by hand instead and
/// attached verbatim via `Url::set_query`, which performs no further
/// encoding of its argument.
fn build_query(req: &AnnounceRequest) -> String {
    format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encoding::percent_encode(&req.info_hash, URL_ENCODE_RESERVED),
        percent_encoding::percent_encode(&req.peer_id, URL_ENCODE_RESERVED),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
    )
}

/// The bencoded tracker response body.
#[derive(Debug, Deserialize)]
struct Body {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Vec<SocketAddr>,
}

/// Accepts either the compact (6-bytes-per-peer) byte string form or the
/// verbose list-of-dictionaries form, dispatching once at the serde
/// boundary rather than carrying a dynamically-typed `peers` field through
/// the rest of the crate.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            fmt.write_str("a compact peer byte string or a list of {ip, port} dicts")
        }

        fn visit_bytes<E>(self, mut bytes: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            if bytes.len() % ENTRY_LEN != 0 {
                return Err(de::Error::custom(
                    "compact peers length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(bytes.len() / ENTRY_LEN);
            while !bytes.is_empty() {
                let ip = Ipv4Addr::from(bytes.get_u32());
                let port = bytes.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&bytes)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct VerbosePeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(VerbosePeer { ip, port }) = seq.next_element()? {
                if let Ok(addr) = ip.parse::<IpAddr>() {
                    peers.push(SocketAddr::new(addr, port));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}
