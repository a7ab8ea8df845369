use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::Event;

/// Encode one unit of work to `[len][bincode][crc32]` format.
/// Returns the number of bytes written.
fn encode_frame(writer: &mut impl Write, events: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Append-only journal of committed units of work.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A frame holds every event of one unit of work, so a torn trailing frame
///   drops the whole unit on replay and never half of it.
///
/// Bytes past `committed_len` belong to frames whose sync has not succeeded
/// yet. `discard_pending` cuts them off again when a batch fails.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    committed_len: u64,
    pending_len: u64,
    pending_frames: u64,
    /// Set when a failed batch could not be cut off the file. Appends are
    /// refused until a compaction rewrites the journal.
    failed: bool,
    #[cfg(test)]
    fail_next_sync: Option<Arc<AtomicBool>>,
}

impl Wal {
    /// Open (or create) the journal at `path`.
    ///
    /// A torn or corrupt tail left by a crash is truncated first, so new
    /// frames never land behind bytes that replay stops at.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (_, valid_len) = read_frames(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped = on_disk - valid_len,
                "truncating unreadable journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len: valid_len,
            pending_len: 0,
            pending_frames: 0,
            failed: false,
            #[cfg(test)]
            fail_next_sync: None,
        })
    }

    /// Append one frame and fsync. Used by tests only; the engine goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer one frame without flushing or syncing.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::other("journal is failed until the next compaction"));
        }
        let written = encode_frame(&mut self.writer, events)?;
        self.pending_len += written;
        self.pending_frames += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file. On success every
    /// buffered frame becomes committed.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if let Some(flag) = &self.fail_next_sync
            && flag.swap(false, Ordering::SeqCst)
        {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_frames = 0;
        Ok(())
    }

    /// Drop every frame buffered or written since the last successful
    /// `flush_sync`: the BufWriter contents are thrown away and the file is
    /// truncated back to its committed length.
    ///
    /// If the truncation itself fails the journal refuses further appends.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        let result = self.truncate_to_committed();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_frames);
        self.pending_len = 0;
        self.pending_frames = 0;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn truncate_to_committed(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // into_parts hands back the unwritten buffer instead of flushing it.
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file and fsync. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, frames: &[Vec<Event>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for frame in frames {
            encode_frame(&mut writer, frame)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the journal and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_frames = 0;
        self.failed = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, frames: &[Vec<Event>]) -> io::Result<()> {
        Self::write_compact_file(&self.path, frames)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Make the next `flush_sync` fail after its bytes reached the file.
    #[cfg(test)]
    pub(crate) fn fail_syncs_on(&mut self, flag: Arc<AtomicBool>) {
        self.fail_next_sync = Some(flag);
    }

    /// Replay the journal from disk, returning every intact frame in order.
    /// Truncated/corrupt trailing frames are discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        read_frames(path).map(|(frames, _)| frames)
    }
}

/// Read every intact frame, plus the byte length of the readable prefix.
fn read_frames(path: &Path) -> io::Result<(Vec<Vec<Event>>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!(path = %path.display(), "journal frame failed crc check, stopping replay");
            break;
        }

        match bincode::deserialize::<Vec<Event>>(&payload) {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
        valid_len += 8 + len as u64;
    }

    Ok((frames, valid_len))
}
