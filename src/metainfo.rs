use crate::Sha1Hash;
use serde_bencode::Error;
use sha1::{Digest, Sha1};

/// The parsed torrent descriptor. The bencode codec itself is out of this
/// crate's scope; this type is merely the shape the core consumes.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    /// The primary tracker URL. Superseded by `announce_list` when present
    /// (BEP 12).
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    /// SHA-1 of the canonical-bencoded info dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces, derived from the concatenated piece hash
    /// string's length.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated piece hash string into individual 20-byte
    /// SHA-1 digests, one per piece, in piece order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// The sum of the lengths of all files, i.e. the logical stream length.
    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length as u64).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }

    /// Whether this torrent describes more than one file.
    pub fn is_archive(&self) -> bool {
        self.info.files.is_some()
    }

    /// Flattens `announce_list`'s tiers into a single list of tracker URLs
    /// in precedence order, falling back to `announce` only when no
    /// `announce_list` is present, per BEP 12 (the list replaces, rather
    /// than supplements, the single announce URL).
    pub fn tracker_urls(&self) -> Vec<String> {
        if let Some(tiers) = &self.announce_list {
            tiers.iter().flatten().cloned().collect()
        } else if let Some(announce) = &self.announce {
            vec![announce.clone()]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pieces: Vec<u8>, length: Option<u64>, files: Option<Vec<File>>) -> Info {
        Info {
            name: "test".to_string(),
            pieces,
            piece_length: 4,
            length,
            files,
            private: None,
        }
    }

    #[test]
    fn piece_count_and_hashes() {
        let pieces = vec![1u8; 40];
        let meta = Metainfo {
            info: info(pieces, Some(8), None),
            announce: None,
            announce_list: None,
        };
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_hashes().len(), 2);
    }

    #[test]
    fn total_len_single_vs_multi_file() {
        let single = Metainfo {
            info: info(vec![0; 20], Some(123), None),
            announce: None,
            announce_list: None,
        };
        assert_eq!(single.total_len(), 123);
        assert!(!single.is_archive());

        let multi = Metainfo {
            info: info(
                vec![0; 20],
                None,
                Some(vec![
                    File { path: vec!["a".into()], length: 10 },
                    File { path: vec!["b".into()], length: 10 },
                ]),
            ),
            announce: None,
            announce_list: None,
        };
        assert_eq!(multi.total_len(), 20);
        assert!(multi.is_archive());
    }

    #[test]
    fn announce_list_replaces_announce_per_bep12() {
        let meta = Metainfo {
            info: info(vec![0; 20], Some(1), None),
            announce: Some("http://primary".into()),
            announce_list: Some(vec![
                vec!["http://tier1a".into(), "http://tier1b".into()],
                vec!["http://tier2".into()],
            ]),
        };
        let urls = meta.tracker_urls();
        assert_eq!(urls, vec!["http://tier1a", "http://tier1b", "http://tier2"]);
        assert!(!urls.contains(&"http://primary".to_string()));
    }

    #[test]
    fn announce_only_when_no_list() {
        let meta = Metainfo {
            info: info(vec![0; 20], Some(1), None),
            announce: Some("http://primary".into()),
            announce_list: None,
        };
        assert_eq!(meta.tracker_urls(), vec!["http://primary".to_string()]);
    }
}
