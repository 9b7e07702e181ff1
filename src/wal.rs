use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errors::{PactumError, Result};
use crate::storage::{DurableLog, Replay, WalRecord};

/// Line-oriented, fsync-backed write-ahead log file.
///
/// Every append writes one newline-terminated line and syncs the file before
/// returning. The format has no length prefix or checksum: a final line
/// without its newline is a torn write and is treated as never appended.
pub struct FileLog {
    path: PathBuf,
    inner: Mutex<Appender>,
}

struct Appender {
    file: File,
    /// Length of the file up to the end of the last complete record.
    durable_len: u64,
    /// Set when a partial append could not be rolled back. The file then
    /// ends in a fragment and takes no more appends until it is reopened.
    poisoned: bool,
}

impl FileLog {
    /// Opens (creating if needed) the log at `path`.
    ///
    /// A torn final line left behind by a crash is cut off so the next append
    /// starts on a fresh line.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(PactumError::Durability)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(PactumError::Durability)?;

        let file_len = file.metadata().map_err(PactumError::Durability)?.len();
        let durable_len = complete_prefix_len(&path)?;
        if durable_len < file_len {
            warn!(
                "Truncating torn tail of {} ({} of {} bytes are complete records)",
                path.display(),
                durable_len,
                file_len
            );
            file.set_len(durable_len).map_err(PactumError::Durability)?;
            file.sync_all().map_err(PactumError::Durability)?;
        }

        info!("Opened write-ahead log {}", path.display());
        Ok(Self {
            path,
            inner: Mutex::new(Appender {
                file,
                durable_len,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for FileLog {
    fn append(&self, record: &WalRecord) -> Result<()> {
        let mut line = record.encode();
        line.push('\n');

        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(PactumError::Durability(io::Error::other(format!(
                "{} has an unrepaired partial record, reopen it to continue",
                self.path.display()
            ))));
        }
        match write_synced(&mut inner.file, line.as_bytes()) {
            Ok(()) => {
                inner.durable_len += line.len() as u64;
                debug!("WAL append {}", record);
                Ok(())
            }
            Err(e) => {
                // Drop whatever part of the line reached the file so the next
                // record does not get glued onto it.
                let durable_len = inner.durable_len;
                if let Err(trunc) = inner.file.set_len(durable_len) {
                    warn!(
                        "Could not roll back partial append to {}, refusing further appends: {}",
                        self.path.display(),
                        trunc
                    );
                    inner.poisoned = true;
                }
                Err(PactumError::Durability(e))
            }
        }
    }

    fn replay(&self) -> Result<Replay<'_>> {
        let file = File::open(&self.path).map_err(PactumError::Durability)?;
        Ok(Box::new(FileReplay {
            reader: BufReader::new(file),
            buf: Vec::new(),
            line_no: 0,
        }))
    }
}

/// Iterator over the complete records of a log file.
struct FileReplay {
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_no: usize,
}

impl Iterator for FileReplay {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(PactumError::Durability(e))),
            }
            self.line_no += 1;

            if self.buf.last() != Some(&b'\n') {
                debug!("Ignoring torn record at line {}", self.line_no);
                return None;
            }

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim_end(),
                Err(e) => {
                    warn!("Skipping non-UTF-8 log line {}: {}", self.line_no, e);
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match WalRecord::parse(line) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => warn!("Skipping malformed log line {}: {}", self.line_no, e),
            }
        }
    }
}

fn write_synced(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()
}

/// Byte length of the file up to and including its last newline.
fn complete_prefix_len(path: &Path) -> Result<u64> {
    let file = File::open(path).map_err(PactumError::Durability)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut complete = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(PactumError::Durability)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            return Ok(complete);
        }
        complete += n as u64;
    }
}
