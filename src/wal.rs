use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only write-ahead log holding every engine event.
///
/// Record framing: `[u32: len][bincode: Event][u32: crc32]`, little-endian.
/// A crash mid-write leaves at most one truncated or CRC-broken trailing
/// record, which replay silently drops.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_rewrite: u64,
}

fn write_record(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

impl Wal {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_rewrite: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one event without flushing. Durable only after `commit()`;
    /// the writer task batches several buffered records per commit.
    pub fn buffer(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_rewrite += 1;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Buffer + commit a single event. Test convenience.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.buffer(event)?;
        self.commit()
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }

    /// Phase one of compaction: write the minimal event set to a temp file
    /// and fsync it. Slow I/O — runs without blocking appenders.
    pub fn write_rewrite_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("wal.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        for event in events {
            write_record(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Phase two of compaction: atomically rename the temp file over the
    /// live log and reopen for appending.
    pub fn swap_rewrite_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_rewrite = 0;
        Ok(())
    }

    /// Replay every valid record from disk. Stops at the first truncated or
    /// corrupt record; a missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let read_rest = reader
                .read_exact(&mut payload)
                .and_then(|()| reader.read_exact(&mut crc_buf));
            match read_rest {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated tail
                Err(e) => return Err(e),
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break; // corrupt record, stop replaying
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}
