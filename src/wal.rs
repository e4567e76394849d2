use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one transaction to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One entry is one committed transaction; its events replay together or not at all.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
///
/// Appends are buffered in memory until `flush_sync`. A failed flush truncates the
/// file back to its last durable length, so no frame of a failed batch survives.
pub struct Wal {
    file: File,
    pending: Vec<u8>,
    /// Bytes on disk that are known to be fsynced.
    durable_len: u64,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            pending: Vec::new(),
            durable_len,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single record and fsync. The writer task uses
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &[Event]) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Encode a record into the pending buffer. Nothing is buffered if encoding fails.
    pub fn append_buffered(&mut self, record: &[Event]) -> io::Result<()> {
        let mut frame = Vec::new();
        encode_record(&mut frame, record)?;
        self.pending.extend_from_slice(&frame);
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Write the pending buffer and fsync. On failure the pending frames are dropped
    /// and the file is cut back to `durable_len`.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                self.pending.clear();
                if let Err(trunc) = self.truncate_to_durable() {
                    tracing::error!("WAL truncation after failed flush failed: {trunc}");
                }
                Err(e)
            }
        }
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot as a single record to a temp file and fsync.
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        encode_record(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = self.file.metadata()?.len();
        self.pending.clear();
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact transaction on disk, oldest first. Reading stops at the first
    /// torn or corrupt frame; whatever follows it is discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }
}

/// Fill `buf` completely; `Ok(false)` on a short read at end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next checksummed payload, or `None` at a clean end, a torn tail, or a CRC mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}
