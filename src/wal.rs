use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Commit;

/// Bytes of framing around each payload: the length prefix and the CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one commit as `[u32 len][bincode payload][u32 crc32]` onto `buf`.
fn frame_commit(buf: &mut Vec<u8>, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// Read every intact entry from the start of `reader`. Returns the commits
/// and the byte length of the intact prefix; scanning stops at the first
/// short read, CRC mismatch or undecodable payload.
fn scan(reader: &mut impl Read) -> io::Result<(Vec<Commit>, u64)> {
    let mut commits = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(reader, &mut len_buf)? {
            break;
        }
        let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        if !read_full(reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_full(reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        let Ok(commit) = bincode::deserialize::<Commit>(&payload) else {
            break;
        };
        valid_len += payload.len() as u64 + FRAME_OVERHEAD;
        commits.push(commit);
    }

    Ok((commits, valid_len))
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of committed transactions.
///
/// Each entry is one [`Commit`], so replay restores a transaction whole or
/// not at all. The file never holds bytes past `len` once a write returns:
/// a batch that fails is cut back off before the error reaches callers, and
/// a torn tail left by a crash is cut off when the log is recovered.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the durable, intact prefix.
    len: u64,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back off. No further
    /// writes are accepted, since the tail of the file is unknown.
    broken: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Wal {
    /// Open (or create) the log at `path`, returning it with every intact
    /// commit. A torn or corrupt tail is truncated so new entries follow
    /// the last good one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let (commits, len) = scan(&mut BufReader::new(&file))?;

        let on_disk = file.metadata()?.len();
        if on_disk > len {
            warn!(
                path = %path.display(),
                dropped = on_disk - len,
                "truncating torn WAL tail"
            );
            file.set_len(len)?;
            file.sync_all()?;
        }

        let wal = Self {
            file,
            path: path.to_path_buf(),
            len,
            appends_since_compact: 0,
            broken: false,
            #[cfg(test)]
            fail_after: None,
        };
        Ok((wal, commits))
    }

    /// Read the intact commits at `path` without opening it for writing.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        scan(&mut BufReader::new(file)).map(|(commits, _)| commits)
    }

    /// Durably append a batch of commits with a single fsync. All of them
    /// land or none do.
    pub fn append_batch(&mut self, commits: &[Commit]) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        let mut buf = Vec::new();
        for commit in commits {
            frame_commit(&mut buf, commit)?;
        }

        if let Err(e) = self.write_durable(&buf) {
            self.discard_tail();
            return Err(e);
        }
        self.len += buf.len() as u64;
        self.appends_since_compact += commits.len() as u64;
        Ok(())
    }

    fn write_durable(&mut self, bytes: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&bytes[..limit.min(bytes.len())])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(bytes)?;
        self.file.sync_all()
    }

    /// Cut the file back to the last durable entry.
    fn discard_tail(&mut self) {
        let result = self.file.set_len(self.len).and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "WAL rollback failed");
            self.broken = true;
        }
    }

    /// Replace the log with `snapshot`: write a temp file, fsync, then
    /// rename it over the log.
    pub fn compact(&mut self, snapshot: &Commit) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut buf = Vec::new();
        frame_commit(&mut buf, snapshot)?;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.len = buf.len() as u64;
        self.appends_since_compact = 0;
        self.broken = false;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Make the next write fail after `bytes` bytes reach the file.
    #[cfg(test)]
    pub(crate) fn fail_next_write_after(&mut self, bytes: usize) {
        self.fail_after = Some(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, Provider};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn provider_commit(id: i64, name: &str) -> Commit {
        Commit {
            changes: vec![Change::ProviderInserted(Provider {
                id,
                name: name.into(),
                surname: "Lovelace".into(),
            })],
        }
    }

    fn framed_len(commit: &Commit) -> usize {
        let mut buf = Vec::new();
        frame_commit(&mut buf, commit).unwrap();
        buf.len()
    }

    #[test]
    fn batches_replay_in_order() {
        let path = tmp_path("batches.wal");
        let first = vec![provider_commit(1, "Ada")];
        let second = vec![
            Commit {
                changes: vec![
                    Change::SlotBookedSet { slot_id: 4, booked: true },
                    Change::ReservationDeleted { id: 2 },
                ],
            },
            provider_commit(2, "Charles"),
        ];
        {
            let (mut wal, replayed) = Wal::recover(&path).unwrap();
            assert!(replayed.is_empty());
            wal.append_batch(&first).unwrap();
            wal.append_batch(&second).unwrap();
            assert_eq!(wal.appends_since_compact(), 3);
        }

        let expected: Vec<Commit> = first.into_iter().chain(second).collect();
        assert_eq!(Wal::replay(&path).unwrap(), expected);
        let (_, recovered) = Wal::recover(&path).unwrap();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&provider_commit(1, "Ada")).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn torn_multi_change_commit_is_dropped_whole() {
        let path = tmp_path("torn_multi.wal");
        let first = provider_commit(1, "Ada");
        let second = Commit {
            changes: vec![
                Change::SlotBookedSet { slot_id: 1, booked: true },
                Change::ReservationDeleted { id: 1 },
            ],
        };
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append_batch(&[first.clone(), second]).unwrap();
        }
        // Chop into the second entry's CRC
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("torn_tail.wal");
        let first = provider_commit(1, "Ada");
        let next = provider_commit(2, "Charles");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append_batch(std::slice::from_ref(&first)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        {
            let (mut wal, recovered) = Wal::recover(&path).unwrap();
            assert_eq!(recovered, vec![first.clone()]);
            wal.append_batch(std::slice::from_ref(&next)).unwrap();
        }

        // Without the truncation the garbage would hide `next` from replay
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, next]);
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let path = tmp_path("failed_batch.wal");
        let kept = provider_commit(1, "Ada");
        let lost = vec![provider_commit(2, "Charles"), provider_commit(3, "Alan")];
        let after = provider_commit(4, "Grace");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append_batch(std::slice::from_ref(&kept)).unwrap();

            // The whole first entry and part of the second reach the file
            wal.fail_next_write_after(framed_len(&lost[0]) + 5);
            assert!(wal.append_batch(&lost).is_err());
            assert_eq!(wal.appends_since_compact(), 1);
            assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

            wal.append_batch(std::slice::from_ref(&after)).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let snapshot = provider_commit(1, "Ada");
        let next = provider_commit(2, "Charles");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            let churn: Vec<Commit> = (0..10).map(|i| provider_commit(i + 100, "churn")).collect();
            wal.append_batch(&churn).unwrap();
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

            wal.append_batch(std::slice::from_ref(&next)).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, next]);
    }
}
