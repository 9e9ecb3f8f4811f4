//! Segmented, checksummed append-only journal.
//!
//! The journal is the durable substrate of the file-backed stores. Every
//! mutation is appended as one framed entry and synced before the caller's
//! in-memory index changes; on open the journal is replayed to rebuild it.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/segment_{id:016x}.log
//!
//! header:  magic "HLOG" | version u16 | segment_id u64 | created_at i64
//! entry:   len u32 | crc32 u32 | payload (len bytes)
//! ```
//!
//! All integers are little-endian. Payloads start with a one-byte entry tag
//! followed by the length-prefixed channel id.
//!
//! # Recovery
//!
//! Segments are replayed in id order. A segment whose header is unreadable is
//! skipped. A torn or corrupt entry ends its segment: the valid prefix is
//! kept and the rest of that segment is dropped with a warning.
//!
//! A writer continues the newest segment only if it replays cleanly to its
//! last byte; a damaged tail is never appended to. A failed append is cut
//! back out of its segment and the next append moves to a fresh one.

use crate::error::{HistoryError, Result};
use crate::types::{
    current_timestamp_nanos, ChannelId, HistoricalRecord, LedgerRecord, ModificationKind,
    StatusCode, Timestamp, ValueRecord,
};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Default maximum segment size (16 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on a single entry payload; anything larger is corruption.
const MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

/// Journal segment file extension.
const SEGMENT_EXTENSION: &str = "log";

/// Journal segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// Journal file magic bytes.
const JOURNAL_MAGIC: [u8; 4] = [b'H', b'L', b'O', b'G'];

/// Journal format version.
const JOURNAL_VERSION: u16 = 1;

/// Durability level of journal appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync` every append. The default.
    #[default]
    Fsync,
    /// `fdatasync` every append; file metadata may lag.
    Fdatasync,
    /// Flush to the OS only. Entries can be lost on power failure.
    None,
}

/// Configuration for journal behavior.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum size of a single segment file before rotation.
    pub segment_size: usize,
    /// How each append is made durable.
    pub sync_mode: SyncMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl JournalConfig {
    /// Sets the segment rotation threshold.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum EntryTag {
    PutEntry = 1,
    DeleteEntry = 2,
    LedgerAppend = 3,
}

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// An entry was inserted or replaced.
    PutEntry {
        /// Channel of the entry.
        channel: ChannelId,
        /// New state of the entry.
        record: ValueRecord,
    },
    /// An entry was deleted.
    DeleteEntry {
        /// Channel of the entry.
        channel: ChannelId,
        /// Timestamp of the deleted entry.
        timestamp: Timestamp,
    },
    /// A ledger record was appended.
    LedgerAppend {
        /// Channel of the ledger record.
        channel: ChannelId,
        /// The appended record.
        record: LedgerRecord,
    },
}

impl JournalEntry {
    /// Returns the channel the entry belongs to.
    pub fn channel(&self) -> &ChannelId {
        match self {
            Self::PutEntry { channel, .. }
            | Self::DeleteEntry { channel, .. }
            | Self::LedgerAppend { channel, .. } => channel,
        }
    }

    fn tag(&self) -> EntryTag {
        match self {
            Self::PutEntry { .. } => EntryTag::PutEntry,
            Self::DeleteEntry { .. } => EntryTag::DeleteEntry,
            Self::LedgerAppend { .. } => EntryTag::LedgerAppend,
        }
    }

    /// Serializes the entry payload.
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.push(self.tag() as u8);
        put_str(&mut bytes, self.channel().as_str());

        match self {
            Self::PutEntry { record, .. } => put_record(&mut bytes, record),
            Self::DeleteEntry { timestamp, .. } => {
                bytes.extend_from_slice(&timestamp.to_le_bytes());
            }
            Self::LedgerAppend { record, .. } => {
                put_record(&mut bytes, record);
                bytes.extend_from_slice(&record.modification_time.to_le_bytes());
                bytes.push(record.kind as u8);
                put_opt_str(&mut bytes, record.actor.as_deref());
                put_opt_str(&mut bytes, record.reason.as_deref());
            }
        }
        bytes
    }

    /// Deserializes an entry payload.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.u8()?;
        let channel = ChannelId::from(decoder.string()?);

        let entry = match tag {
            x if x == EntryTag::PutEntry as u8 => Self::PutEntry {
                channel,
                record: decoder.record()?,
            },
            x if x == EntryTag::DeleteEntry as u8 => Self::DeleteEntry {
                channel,
                timestamp: decoder.i64()?,
            },
            x if x == EntryTag::LedgerAppend as u8 => {
                let ValueRecord {
                    timestamp,
                    value,
                    status,
                } = decoder.record()?;
                let modification_time = decoder.i64()?;
                let kind_tag = decoder.u8()?;
                let kind = ModificationKind::from_u8(kind_tag).ok_or_else(|| {
                    HistoryError::CorruptEntry(format!("Unknown modification kind {}", kind_tag))
                })?;
                let actor = decoder.opt_string()?;
                let reason = decoder.opt_string()?;
                Self::LedgerAppend {
                    channel,
                    record: LedgerRecord {
                        timestamp,
                        value,
                        status,
                        modification_time,
                        kind,
                        actor,
                        reason,
                    },
                }
            }
            other => {
                return Err(HistoryError::CorruptEntry(format!(
                    "Unknown journal entry tag {}",
                    other
                )))
            }
        };

        decoder.finish()?;
        Ok(entry)
    }
}

/// Writes the fields every historized record carries: timestamp, status and
/// value. [`Decoder::record`] reads them back.
fn put_record(bytes: &mut Vec<u8>, record: &impl HistoricalRecord) {
    bytes.extend_from_slice(&record.timestamp().to_le_bytes());
    bytes.extend_from_slice(&record.status().0.to_le_bytes());
    put_str(bytes, record.value());
}

fn put_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
    bytes.extend_from_slice(s.as_bytes());
}

fn put_opt_str(bytes: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            bytes.push(1);
            put_str(bytes, s);
        }
        None => bytes.push(0),
    }
}

/// Cursor over an entry payload.
struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| HistoryError::CorruptEntry("Truncated journal entry".to_string()))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| HistoryError::CorruptEntry("Truncated journal string".to_string()))?;
        self.pos = end;
        String::from_utf8(slice.to_vec())
            .map_err(|err| HistoryError::CorruptEntry(format!("Invalid UTF-8: {}", err)))
    }

    fn record(&mut self) -> Result<ValueRecord> {
        let timestamp = self.i64()?;
        let status = StatusCode(self.u32()?);
        let value = self.string()?;
        Ok(ValueRecord::new(timestamp, value, status))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string().map(Some),
            flag => Err(HistoryError::CorruptEntry(format!(
                "Invalid option flag {}",
                flag
            ))),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(HistoryError::CorruptEntry(format!(
                "{} trailing bytes in journal entry",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Journal segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 22; // 4 + 2 + 8 + 8

    fn new(segment_id: u64) -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            segment_id,
            created_at: current_timestamp_nanos().unwrap_or(0),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != JOURNAL_MAGIC {
            return Err(HistoryError::InvalidMagic(magic));
        }

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        let version = u16::from_le_bytes(buf);

        if version != JOURNAL_VERSION {
            return Err(HistoryError::UnsupportedVersion(version));
        }

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let segment_id = u64::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let created_at = i64::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            segment_id,
            created_at,
        })
    }
}

/// Append-only journal writer.
pub struct Journal {
    /// Directory containing journal segments.
    dir: PathBuf,
    /// Segment receiving appends.
    current_segment: BufWriter<File>,
    /// Current segment ID.
    current_segment_id: u64,
    /// Bytes of the open segment known to be on disk, header included.
    current_segment_size: usize,
    /// Set after a failed append. The buffer may still hold the failed
    /// frame, so it is never flushed and the next append rotates.
    poisoned: bool,
    /// Journal configuration.
    config: JournalConfig,
    #[cfg(test)]
    injected_fault: Option<InjectedFault>,
}

/// Failure to inject into the next append.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InjectedFault {
    /// Fail after the length prefix reached the write buffer.
    Write,
    /// Fail after the frame reached the file, before it is synced.
    Sync,
}

impl Journal {
    /// Opens a journal in `dir` for appending.
    ///
    /// The directory is created if missing. Writing continues at the end of
    /// the newest segment when that segment replays cleanly to its last
    /// byte; otherwise a fresh segment is started after the highest existing
    /// id. Use [`Journal::recover`] to read the existing entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or segment cannot be opened.
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let newest = list_segments(&dir)?
            .into_iter()
            .filter_map(|path| parse_segment_id(&path).map(|id| (id, path)))
            .max_by_key(|(id, _)| *id);

        let (current_segment, current_segment_id, current_segment_size) = match newest {
            Some((id, path)) => match reopen_segment(&path)? {
                Some((writer, size)) => {
                    debug!("Continuing journal segment {}", path.display());
                    (writer, id, size)
                }
                None => (create_segment(&dir, id + 1)?, id + 1, SegmentHeader::SIZE),
            },
            None => (create_segment(&dir, 0)?, 0, SegmentHeader::SIZE),
        };

        Ok(Self {
            dir,
            current_segment,
            current_segment_id,
            current_segment_size,
            poisoned: false,
            config,
            #[cfg(test)]
            injected_fault: None,
        })
    }

    /// Reads every entry of every segment in `dir`, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read. Damaged segments are
    /// skipped or cut short with a warning.
    pub fn recover(dir: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut all_entries = Vec::new();
        for segment_path in list_segments(dir)? {
            match read_segment(&segment_path) {
                Ok((entries, _)) => {
                    debug!(
                        "Replayed {} entries from segment {}",
                        entries.len(),
                        segment_path.display()
                    );
                    all_entries.extend(entries);
                }
                Err(e) => {
                    warn!(
                        "Skipping journal segment {}: {:?}",
                        segment_path.display(),
                        e
                    );
                }
            }
        }

        debug!("Total recovered journal entries: {}", all_entries.len());
        Ok(all_entries)
    }

    /// Appends one entry and syncs it according to the configured mode.
    ///
    /// On failure the segment is cut back to its length before the call, so
    /// a failed entry is never replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let data = entry.to_bytes();
        if self.poisoned
            || (self.current_segment_size + data.len() + 8 > self.config.segment_size
                && self.current_segment_size > SegmentHeader::SIZE)
        {
            self.rotate_segment()?;
        }

        let committed = self.current_segment_size;
        match self.write_frame(&data).and_then(|()| self.sync()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.discard_since(committed);
                Err(err)
            }
        }
    }

    /// Rewrites the journal so it contains exactly `live` entries.
    ///
    /// The entries are written to a fresh segment, synced, and only then are
    /// all older segments removed. A crash in between leaves the older
    /// segments in place; replaying them followed by the fresh segment yields
    /// the same state.
    ///
    /// Returns the number of segments removed.
    pub fn compact<'a>(
        &mut self,
        live: impl IntoIterator<Item = &'a JournalEntry>,
    ) -> Result<usize> {
        self.rotate_segment()?;
        if let Err(err) = self.write_live(live) {
            self.discard_since(SegmentHeader::SIZE);
            return Err(err);
        }

        let mut removed = 0;
        for segment_path in list_segments(&self.dir)? {
            match parse_segment_id(&segment_path) {
                Some(id) if id < self.current_segment_id => {
                    fs::remove_file(&segment_path)?;
                    debug!("Removed compacted journal segment: {}", segment_path.display());
                    removed += 1;
                }
                _ => {}
            }
        }
        sync_dir(&self.dir)?;

        Ok(removed)
    }

    /// Flushes buffered bytes and syncs per the configured mode.
    pub fn sync(&mut self) -> Result<()> {
        if self.poisoned {
            return Ok(());
        }
        self.current_segment.flush()?;

        #[cfg(test)]
        if self.injected_fault == Some(InjectedFault::Sync) {
            self.injected_fault = None;
            return Err(std::io::Error::other("injected sync failure").into());
        }

        match self.config.sync_mode {
            SyncMode::Fsync => {
                self.current_segment.get_ref().sync_all()?;
            }
            SyncMode::Fdatasync => {
                self.current_segment.get_ref().sync_data()?;
            }
            SyncMode::None => {
                // Left to the OS page cache.
            }
        }
        Ok(())
    }

    /// Id of the segment receiving appends.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    /// Returns the number of segment files on disk.
    pub fn segment_count(&self) -> Result<usize> {
        Ok(list_segments(&self.dir)?.len())
    }

    /// Returns the journal directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Makes the next append fail with `fault`.
    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: InjectedFault) {
        self.injected_fault = Some(fault);
    }

    fn write_live<'a>(&mut self, live: impl IntoIterator<Item = &'a JournalEntry>) -> Result<()> {
        for entry in live {
            let data = entry.to_bytes();
            self.write_frame(&data)?;
        }
        self.current_segment.flush()?;
        self.current_segment.get_ref().sync_all()?;
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let crc = crc32fast::hash(data);

        // Write: length (4) + crc (4) + data
        self.current_segment
            .write_all(&(data.len() as u32).to_le_bytes())?;

        #[cfg(test)]
        if self.injected_fault == Some(InjectedFault::Write) {
            self.injected_fault = None;
            return Err(std::io::Error::other("injected write failure").into());
        }

        self.current_segment.write_all(&crc.to_le_bytes())?;
        self.current_segment.write_all(data)?;
        self.current_segment_size += 4 + 4 + data.len();
        Ok(())
    }

    /// Drops everything written after `committed` bytes of the open segment.
    ///
    /// Buffered bytes are abandoned by poisoning the writer; bytes that
    /// already reached the file are cut off.
    fn discard_since(&mut self, committed: usize) {
        self.poisoned = true;
        if let Err(e) = self.current_segment.get_ref().set_len(committed as u64) {
            error!(
                "Failed to cut journal segment {} back to {} bytes: {:?}",
                self.current_segment_id, committed, e
            );
        }
        self.current_segment_size = committed;
    }

    fn rotate_segment(&mut self) -> Result<()> {
        if !self.poisoned {
            self.current_segment.flush()?;
            self.current_segment.get_ref().sync_all()?;
        }

        let next_segment_id = self.current_segment_id + 1;
        let next = create_segment(&self.dir, next_segment_id)?;
        let previous = std::mem::replace(&mut self.current_segment, next);
        // Releases the file without flushing what a failed append left behind.
        let (_file, _abandoned) = previous.into_parts();

        self.current_segment_id = next_segment_id;
        self.current_segment_size = SegmentHeader::SIZE;
        self.poisoned = false;

        debug!(
            "Rotated to journal segment {} in {}",
            self.current_segment_id,
            self.dir.display()
        );
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Err(e) = self.current_segment.flush() {
            warn!("Failed to flush journal on drop: {:?}", e);
        }
    }
}

/// Path of segment `segment_id` inside `dir`.
fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!(
        "{}_{:016x}.{}",
        SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
    ))
}

/// Segment id encoded in a segment file name, if it is one.
fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}

/// Lists segment files sorted by id.
fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION)
            && parse_segment_id(&path).is_some()
        {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

fn create_segment(dir: &Path, segment_id: u64) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(segment_path(dir, segment_id))?;

    let mut writer = BufWriter::new(file);
    SegmentHeader::new(segment_id).write_to(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(writer)
}

fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Reads the valid entries of a segment file, together with the byte length
/// of that valid prefix.
fn read_segment(path: &Path) -> Result<(Vec<JournalEntry>, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let _header = SegmentHeader::read_from(&mut reader)?;

    let mut entries = Vec::new();
    let mut valid_len = SegmentHeader::SIZE as u64;
    loop {
        match read_entry(&mut reader) {
            Ok(Some((entry, frame_len))) => {
                entries.push(entry);
                valid_len += frame_len as u64;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    "Truncating replay of {} after {} entries: {:?}",
                    path.display(),
                    entries.len(),
                    e
                );
                break;
            }
        }
    }

    Ok((entries, valid_len))
}

/// Opens `path` for appending if it replays cleanly to its last byte.
///
/// Returns the writer and the segment size, or `None` if the segment is
/// damaged and must not be extended.
fn reopen_segment(path: &Path) -> Result<Option<(BufWriter<File>, usize)>> {
    let valid_len = match read_segment(path) {
        Ok((_, valid_len)) => valid_len,
        Err(_) => return Ok(None),
    };
    if valid_len != fs::metadata(path)?.len() {
        return Ok(None);
    }

    let file = OpenOptions::new().append(true).open(path)?;
    Ok(Some((BufWriter::new(file), valid_len as usize)))
}

/// Reads a single framed entry and its frame length; `None` at a clean end
/// of segment.
fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(JournalEntry, usize)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len == 0 || len > MAX_ENTRY_SIZE {
        return Err(HistoryError::CorruptEntry(format!(
            "Invalid journal entry length {}",
            len
        )));
    }

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let actual_crc = crc32fast::hash(&data);
    if actual_crc != expected_crc {
        return Err(HistoryError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    let entry = JournalEntry::from_bytes(&data)?;
    Ok(Some((entry, 4 + 4 + len)))
}
