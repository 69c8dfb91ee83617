//! The torrent coordinator: ties together metainfo, tracker aggregation,
//! the piece scheduler, and the file sink into a single leeching
//! download session.

use std::sync::Arc;

use crate::{
    conf::TorrentConf,
    disk::FileSink,
    error::*,
    metainfo::Metainfo,
    scheduler::PieceScheduler,
    storage_info::StorageInfo,
    tracker::{AnnounceRequest, TrackerAggregator},
    PeerId, PieceTask,
};

/// Owns a single torrent download end to end: resolves peers from every
/// tracker the metainfo names, fetches and verifies every piece, and
/// places the results on disk.
pub struct TorrentCoordinator {
    metainfo: Metainfo,
    conf: TorrentConf,
    peer_id: PeerId,
}

impl TorrentCoordinator {
    pub fn new(metainfo: Metainfo, conf: TorrentConf, peer_id: PeerId) -> Self {
        Self {
            metainfo,
            conf,
            peer_id,
        }
    }

    /// Runs the download to completion: announces to every tracker,
    /// fetches every piece from whichever peers claim to have it, and
    /// writes each to its place on disk. Returns once every piece has
    /// landed, or the first unrecoverable error (no peers, or the
    /// scheduler stalling out).
    pub async fn run(self) -> Result<()> {
        let info_hash = self.metainfo.create_info_hash()?;
        let storage = StorageInfo::new(&self.metainfo, self.conf.download_dir.clone());
        let piece_count = storage.piece_count;

        log::info!(
            "starting torrent {:?} info_hash={} ({} pieces, {} bytes)",
            self.metainfo.info.name,
            hex::encode(info_hash),
            piece_count,
            storage.download_len
        );

        let mut sink = FileSink::new(&storage)?;

        let tracker_urls = self.metainfo.tracker_urls();
        let aggregator = TrackerAggregator::new(&tracker_urls, self.conf.udp_tracker_max_retries);
        let announce = AnnounceRequest {
            info_hash,
            peer_id: self.peer_id,
            port: 0,
            uploaded: 0,
            downloaded: 0,
            // spec fixes this to 0 on the wire for both HTTP and UDP
            // trackers; this core never reports real progress to trackers.
            left: 0,
        };
        let peers = aggregator.announce_all(announce).await?;
        log::info!("resolved {} peer(s) from trackers", peers.len());

        let piece_hashes = self.metainfo.piece_hashes();
        let tasks = (0..piece_count)
            .map(|index| {
                Ok(PieceTask {
                    index,
                    expected_hash: piece_hashes[index],
                    len: storage.piece_len(index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let scheduler = PieceScheduler::new(tasks);
        let conf = Arc::new(self.conf);
        scheduler
            .run(
                peers,
                info_hash,
                self.peer_id,
                piece_count,
                conf,
                |piece| sink.write_piece(&storage, piece.index, &piece.bytes),
            )
            .await?;

        sink.finalize()?;
        log::info!("torrent {:?} complete", self.metainfo.info.name);

        Ok(())
    }
}
