use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload replay will allocate for. Anything bigger is a corrupt
/// length prefix.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {} bytes exceeds {MAX_RECORD_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Record {
    Event(Event),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is discarded.
    Damaged(&'static str),
}

/// `read_exact` that reports a short read as `Ok(false)`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Record::End),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Damaged("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Record::Damaged("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Record::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event)),
        Err(_) => Ok(Record::Damaged("undecodable payload")),
    }
}

/// Append-only write-ahead log of [`Event`]s.
///
/// Format per entry: `[u32 len][bincode Event][u32 crc32]`, little endian.
/// `len` counts the payload only. A torn last entry (crash mid-write) is
/// detected by the length prefix and checksum and dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one event and fsync. The engine goes through
    /// `append_buffered` + `flush_sync` instead, for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Append a group of events and fsync them as one unit. If any record
    /// fails to encode or write, the file is cut back to its length before
    /// the batch so replay never sees part of a failed batch.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        self.writer.flush()?;
        let mark = self.writer.get_ref().metadata()?.len();
        let appends_before = self.appends_since_compact;
        let written = || -> io::Result<()> {
            for event in events {
                self.append_buffered(event)?;
            }
            self.flush_sync()
        };
        let Err(e) = written() else {
            return Ok(());
        };
        self.appends_since_compact = appends_before;
        if let Err(rollback) = self.truncate_to(mark) {
            tracing::error!("WAL {}: cannot roll back failed batch: {rollback}", self.path.display());
        }
        Err(e)
    }

    /// Drop unflushed bytes and shrink the file to `len`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer instead of flushing it on drop.
        let (_, _unwritten) = failed.into_parts();
        let file = self.writer.get_ref();
        file.set_len(len)?;
        file.sync_all()
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A missing file is an empty log;
    /// a damaged tail is logged and dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Damaged(why) => {
                    tracing::warn!(
                        "WAL {}: {why} after {} events; discarding the rest",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Booking;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("citystage_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn location(address: &str) -> Event {
        Event::LocationCreated {
            id: Ulid::new(),
            address: address.into(),
            img: String::new(),
        }
    }

    fn booking_created(time: &str) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                location_id: Ulid::new(),
                date: "2025-07-01".parse().unwrap(),
                time: time.into(),
                duration_hours: 1,
                created_at: 1_751_000_000_000,
            },
            cooldown_until: 1_751_500_800_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            location("Невский пр., 28"),
            booking_created("14:00"),
            Event::SettingChanged {
                key: "cooldown_days".into(),
                value: "3".into(),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = booking_created("10:00");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x10, 0, 0, 0, 1, 2]).unwrap(); // len=16, two payload bytes
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = location("Литейный пр., 5");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&booking_created("12:00")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_rejects_absurd_length() {
        let path = tmp_path("absurd_len.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let kept = location("Арбат, 10");
        let later = booking_created("16:00");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            for _ in 0..10 {
                wal.append(&booking_created("09:00")).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        assert!(!Wal::compact_path(&path).exists());
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (9..14).map(|h| booking_created(&format!("{h}:00"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let path = tmp_path("failed_batch.wal");
        let before = location("Невский пр., 28");
        let after = booking_created("15:00");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&before).unwrap();
        let len = fs::metadata(&path).unwrap().len();

        let oversized = location(&"x".repeat(MAX_RECORD_LEN));
        let batch = [booking_created("10:00"), oversized, booking_created("12:00")];
        assert!(wal.append_batch(&batch).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append_batch([&after]).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![before, after]);
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = std::env::temp_dir().join(format!("citystage_test_wal_dir_{}", Ulid::new()));
        let path = dir.join("nested").join("log.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&location("Садовая ул., 3")).unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
