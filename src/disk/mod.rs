//! The file sink: places a verified piece's bytes onto disk, splitting
//! across files when a piece straddles more than one of them.
//!
//! Pieces arrive at the sink already hashed and verified by the piece
//! scheduler, so unlike a seeding-capable client this never assembles
//! blocks or re-reads a file to serve one: each call is a single,
//! unconditional placement of a whole piece.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
};

use nix::sys::uio::pwrite;

use crate::{
    error::*,
    storage_info::{FsStructure, StorageInfo},
    PieceIndex,
};

/// One of the torrent's on-disk files, opened and pre-allocated to its
/// final length up front.
struct SinkFile {
    info: crate::FileInfo,
    handle: File,
    bytes_written: u64,
    closed: bool,
}

impl SinkFile {
    fn open(download_dir: &std::path::Path, info: crate::FileInfo) -> Result<Self> {
        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        handle.set_len(info.len)?;
        log::debug!("opened sink file {:?} ({} bytes)", path, info.len);
        Ok(Self {
            info,
            handle,
            bytes_written: 0,
            closed: false,
        })
    }

    fn write_at(&mut self, chunk: &[u8], offset: u64) -> Result<()> {
        let mut written = 0;
        while written < chunk.len() {
            let n = pwrite(self.handle.as_raw_fd(), &chunk[written..], (offset + written as u64) as i64)
                .map_err(|e| {
                    log::warn!("write to {:?} failed: {}", self.info.path, e);
                    Error::DiskWriteFailed(format!("{:?}: {}", self.info.path, e))
                })?;
            if n == 0 {
                return Err(Error::DiskWriteFailed(format!(
                    "{:?}: write returned 0 bytes",
                    self.info.path
                )));
            }
            written += n;
        }
        self.bytes_written += chunk.len() as u64;
        if self.bytes_written >= self.info.len {
            self.closed = true;
        }
        Ok(())
    }
}

/// Owns the open file handles for every file in the torrent and places
/// completed pieces into them.
pub(crate) struct FileSink {
    files: Vec<SinkFile>,
}

impl FileSink {
    /// Opens (creating if necessary) every file named by `storage`,
    /// pre-allocated to its full length.
    pub fn new(storage: &StorageInfo) -> Result<Self> {
        std::fs::create_dir_all(&storage.download_dir)?;
        let infos: Vec<crate::FileInfo> = match &storage.structure {
            FsStructure::File(file) => vec![file.clone()],
            FsStructure::Archive { files } => files.clone(),
        };
        let files = infos
            .into_iter()
            .map(|info| SinkFile::open(&storage.download_dir, info))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { files })
    }

    /// Writes a whole, already-verified piece to whichever file(s) it
    /// overlaps. Mirrors the running-offset splitting a multi-file piece
    /// needs: each file after the first is written starting at its own
    /// `torrent_offset`, which only the running write cursor (not the
    /// original piece offset) tracks correctly.
    pub fn write_piece(
        &mut self,
        storage: &StorageInfo,
        index: PieceIndex,
        bytes: &[u8],
    ) -> Result<()> {
        let file_range = storage.files_intersecting_piece(index)?;
        let piece_offset = index as u64 * storage.piece_len as u64;

        let mut write_offset = piece_offset;
        let mut remaining = bytes;
        for file_index in file_range {
            let file = &mut self.files[file_index];
            let slice = file.info.get_slice(write_offset, remaining.len() as u64);
            let chunk_len = slice.len as usize;
            let (chunk, rest) = remaining.split_at(chunk_len);
            file.write_at(chunk, slice.offset)?;
            write_offset += chunk_len as u64;
            remaining = rest;
        }
        debug_assert!(remaining.is_empty(), "piece bytes left over after placement");

        Ok(())
    }

    /// Flushes every file to disk. Called once the download completes.
    pub fn finalize(&mut self) -> Result<()> {
        for file in &mut self.files {
            file.handle.sync_all().map_err(io::Error::from)?;
            if !file.closed {
                log::warn!(
                    "file {:?} finalized with {} of {} bytes written",
                    file.info.path,
                    file.bytes_written,
                    file.info.len
                );
            }
        }
        Ok(())
    }
}
