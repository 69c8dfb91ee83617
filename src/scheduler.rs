//! The piece scheduler: a work-stealing queue of piece tasks drained by
//! one worker per peer endpoint, and the central loop that collects
//! completed, verified pieces until the torrent is whole.

use std::{collections::HashSet, sync::Arc};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, time};

use crate::{
    conf::TorrentConf, error::*, peer::PeerSession, PeerEndpoint, PeerId, PieceIndex, PieceTask,
    Sha1Hash,
};

/// A piece that has been fetched from some peer and passed its integrity
/// check.
pub(crate) struct CompletedPiece {
    pub index: PieceIndex,
    pub bytes: Vec<u8>,
}

/// Owns the shared piece queue and the channel workers report completions
/// on. Workers are spawned by [`PieceScheduler::run`], one per peer
/// endpoint; the queue and completion channel are the only state shared
/// across them.
pub(crate) struct PieceScheduler {
    tasks: Vec<PieceTask>,
}

impl PieceScheduler {
    /// Builds a scheduler pre-loaded with every piece task; `tasks` need
    /// not be in any particular order.
    pub fn new(tasks: Vec<PieceTask>) -> Self {
        Self { tasks }
    }

    /// Spawns one worker task per peer endpoint and drives completions to
    /// `on_piece` until every piece index has arrived at least once, or
    /// the idle timer fires with pieces still outstanding
    /// (`Error::DownloadStalled`). `on_piece` runs on the same task that
    /// calls `run` (the torrent coordinator), never inside a worker — the
    /// file sink is never touched by peer workers.
    pub async fn run<F>(
        self,
        peers: HashSet<PeerEndpoint>,
        info_hash: Sha1Hash,
        our_peer_id: PeerId,
        piece_count: usize,
        conf: Arc<TorrentConf>,
        mut on_piece: F,
    ) -> Result<()>
    where
        F: FnMut(CompletedPiece) -> Result<()>,
    {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        for task in self.tasks {
            queue_tx
                .send(task)
                .await
                .expect("piece queue receiver dropped before workers started");
        }

        let (completed_tx, mut completed_rx) = mpsc::channel(32);

        let mut workers = Vec::new();
        for addr in peers {
            let queue_tx = queue_tx.clone();
            let queue_rx = queue_rx.clone();
            let completed_tx = completed_tx.clone();
            let conf = Arc::clone(&conf);
            workers.push(tokio::spawn(async move {
                worker_loop(
                    addr,
                    info_hash,
                    our_peer_id,
                    piece_count,
                    conf,
                    queue_rx,
                    queue_tx,
                    completed_tx,
                )
                .await;
            }));
        }
        // Drop our own handles: the queue and completion channel now live
        // only in the worker tasks, so the completion channel naturally
        // closes once every worker has exited.
        drop(queue_tx);
        drop(completed_tx);

        let mut completed_indices = HashSet::with_capacity(piece_count);
        let result = loop {
            if completed_indices.len() >= piece_count {
                break Ok(());
            }
            match time::timeout(conf.idle_timeout, completed_rx.recv()).await {
                Ok(Some(piece)) => {
                    if completed_indices.insert(piece.index) {
                        log::info!("piece {} complete", piece.index);
                        if let Err(e) = on_piece(piece) {
                            break Err(e);
                        }
                    } else {
                        log::debug!("discarding duplicate piece {}", piece.index);
                    }
                }
                Ok(None) => {
                    log::error!("every peer worker exited before the download finished");
                    break Err(Error::DownloadStalled);
                }
                Err(_) => {
                    log::error!("idle timeout elapsed with pieces still outstanding");
                    break Err(Error::DownloadStalled);
                }
            }
        };

        // Every worker still running at this point is either blocked on
        // `queue_rx.recv()` with the queue drained (closing the channel
        // wakes it with an error) or stuck inside a peer I/O call (aborting
        // the task is the only way to reclaim its socket promptly). Both are
        // required: closing the queue alone never touches an in-flight
        // `fetch_piece`, and aborting alone would still leak workers that
        // are legitimately idle on `recv()`. Without this, completed or
        // stalled downloads would leave one live TCP connection and one
        // parked task per remaining peer for the rest of the process.
        queue_rx.close();
        for worker in workers {
            worker.abort();
        }

        result
    }
}

/// One worker per peer: connects, then repeatedly pulls a task off the
/// shared queue, fetches it if the peer claims to have it, verifies its
/// hash, and reports it.
async fn worker_loop(
    addr: PeerEndpoint,
    info_hash: Sha1Hash,
    our_peer_id: PeerId,
    piece_count: usize,
    conf: Arc<TorrentConf>,
    queue_rx: async_channel::Receiver<PieceTask>,
    queue_tx: async_channel::Sender<PieceTask>,
    mut completed_tx: mpsc::Sender<CompletedPiece>,
) {
    let mut session =
        match PeerSession::connect(addr, info_hash, our_peer_id, piece_count, &conf).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("peer {} session failed to start: {}", addr, e);
                return;
            }
        };

    while let Ok(task) = queue_rx.recv().await {
        if !session.has(task.index) {
            requeue(&queue_tx, task).await;
            continue;
        }

        match session.fetch_piece(&task, &conf).await {
            Ok(bytes) => {
                if piece_hash_matches(&bytes, &task.expected_hash) {
                    // advisory; failure to send it isn't fatal to the piece
                    if let Err(e) = session.send_have(task.index, &conf).await {
                        log::debug!("peer {} failed to send have: {}", addr, e);
                    }
                    if completed_tx
                        .send(CompletedPiece {
                            index: task.index,
                            bytes,
                        })
                        .await
                        .is_err()
                    {
                        // coordinator is gone; nothing left to do
                        return;
                    }
                } else {
                    log::warn!(
                        "peer {} delivered piece {} that failed its hash check",
                        addr,
                        task.index
                    );
                    requeue(&queue_tx, task).await;
                }
            }
            Err(e) => {
                log::warn!(
                    "peer {} lost piece {} ({}); closing session",
                    addr,
                    task.index,
                    e
                );
                requeue(&queue_tx, task).await;
                return;
            }
        }
    }
}

async fn requeue(queue_tx: &async_channel::Sender<PieceTask>, task: PieceTask) {
    if queue_tx.send(task).await.is_err() {
        log::error!("piece queue has no receivers left; task lost");
    }
}

fn piece_hash_matches(bytes: &[u8], expected: &Sha1Hash) -> bool {
    let digest = Sha1::digest(bytes);
    let mut actual = [0u8; 20];
    actual.copy_from_slice(&digest);
    &actual == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_check_detects_mismatch() {
        let bytes = b"hello world".to_vec();
        let wrong = [0u8; 20];
        assert!(!piece_hash_matches(&bytes, &wrong));

        let digest = Sha1::digest(&bytes);
        let mut correct = [0u8; 20];
        correct.copy_from_slice(&digest);
        assert!(piece_hash_matches(&bytes, &correct));
    }
}
