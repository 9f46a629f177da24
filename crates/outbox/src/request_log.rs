//! Durable log of pending persisted requests.
//!
//! `FileRequestLog` keeps requests in a single append-only file of
//! length-prefixed, CRC32-checked JSON records. Removals rewrite the retained
//! records into a temp file and rename it over the log. Every operation holds
//! an exclusive advisory lock on a sibling lock file, so cooperating processes
//! sharing the directory never interleave an append with a rewrite.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use crc32fast::Hasher;
use fs2::FileExt;

use crate::types::{Request, RequestFilter, RequestId, RequestLog};

/// File name used for the log within the data directory.
const LOG_FILE: &str = "requests.log";
/// Advisory lock guarding every log operation.
const LOCK_FILE: &str = "requests.lock";
/// Size of the record header (length + checksum).
const RECORD_HEADER_LEN: u64 = 8;

/// File-backed request log shared by processes using the same directory.
#[derive(Debug, Clone)]
pub struct FileRequestLog {
    dir: PathBuf,
    log_path: PathBuf,
    lock_path: PathBuf,
}

impl FileRequestLog {
    /// Open or create a log directory, dropping any torn trailing record.
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create request log dir")?;
        let log = Self {
            log_path: dir.join(LOG_FILE),
            lock_path: dir.join(LOCK_FILE),
            dir,
        };
        let _guard = LogLock::acquire(&log.lock_path)?;
        let repaired = repair_tail(&log.log_path)?;
        if repaired > 0 {
            tracing::warn!(
                path = %log.log_path.display(),
                bytes = repaired,
                "truncated torn record at end of request log"
            );
        }
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run one locked operation on the blocking pool.
    async fn locked<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> anyhow::Result<T> + Send + 'static,
    {
        let log_path = self.log_path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = LogLock::acquire(&lock_path)?;
            op(&log_path)
        })
        .await
        .context("request log task join")?
    }
}

#[async_trait]
impl RequestLog for FileRequestLog {
    async fn append(&self, request: Request) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&request).context("encode request")?;
        self.locked(move |path| {
            repair_tail(path)?;
            let mut file = open_log_for_append(path).context("open request log")?;
            write_record(&mut file, &payload)?;
            file.flush()?;
            file.sync_data().context("sync request log")?;
            Ok(())
        })
        .await
    }

    async fn read_all(&self) -> anyhow::Result<Vec<Request>> {
        self.locked(|path| Ok(read_log_entries(path)?.0)).await
    }

    async fn remove(&self, id: RequestId) -> anyhow::Result<bool> {
        self.locked(move |path| {
            let (entries, _) = read_log_entries(path)?;
            let before = entries.len();
            let kept: Vec<Request> = entries.into_iter().filter(|e| e.id != id).collect();
            if kept.len() == before {
                return Ok(false);
            }
            rewrite_log(path, &kept)?;
            Ok(true)
        })
        .await
    }

    async fn retain(&self, keep: RequestFilter) -> anyhow::Result<Vec<Request>> {
        self.locked(move |path| {
            let (entries, _) = read_log_entries(path)?;
            let (kept, removed): (Vec<Request>, Vec<Request>) =
                entries.into_iter().partition(|e| keep(e));
            if !removed.is_empty() {
                rewrite_log(path, &kept)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn remove_head(&self) -> anyhow::Result<Option<Request>> {
        self.locked(|path| {
            let (mut entries, _) = read_log_entries(path)?;
            if entries.is_empty() {
                return Ok(None);
            }
            let head = entries.remove(0);
            rewrite_log(path, &entries)?;
            Ok(Some(head))
        })
        .await
    }
}

/// In-process request log. Clones share the same entries, which lets tests
/// simulate a restart by handing the same log to a fresh queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryRequestLog {
    entries: Arc<Mutex<VecDeque<Request>>>,
}

impl MemoryRequestLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestLog for MemoryRequestLog {
    async fn append(&self, request: Request) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().expect("request log lock");
        entries.push_back(request);
        Ok(())
    }

    async fn read_all(&self) -> anyhow::Result<Vec<Request>> {
        let entries = self.entries.lock().expect("request log lock");
        Ok(entries.iter().cloned().collect())
    }

    async fn remove(&self, id: RequestId) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().expect("request log lock");
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return Ok(false);
        };
        entries.remove(pos);
        Ok(true)
    }

    async fn retain(&self, keep: RequestFilter) -> anyhow::Result<Vec<Request>> {
        let mut entries = self.entries.lock().expect("request log lock");
        let (kept, removed): (Vec<Request>, Vec<Request>) =
            entries.drain(..).partition(|e| keep(e));
        *entries = kept.into();
        Ok(removed)
    }

    async fn head(&self) -> anyhow::Result<Option<Request>> {
        let entries = self.entries.lock().expect("request log lock");
        Ok(entries.front().cloned())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.lock().expect("request log lock").len())
    }
}

/// Exclusive advisory lock; closing the file on drop releases it.
struct LogLock {
    _file: File,
}

impl LogLock {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open request log lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("acquire request log lock {}", path.display()))?;
        Ok(Self { _file: file })
    }
}

/// Open the log file for appending.
fn open_log_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

/// Read and decode all complete records.
///
/// Returns the entries and the byte length they cover. A record cut short by
/// a crash ends the scan; a complete record with a bad checksum is an error.
fn read_log_entries(path: &Path) -> anyhow::Result<(Vec<Request>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        // Missing log means nothing is pending.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(
            hasher.finalize() == expected_crc,
            "request log checksum mismatch at offset {valid_len}"
        );
        let request: Request =
            serde_json::from_slice(&payload).context("decode request log record")?;
        entries.push(request);
        valid_len += RECORD_HEADER_LEN + len as u64;
    }
    Ok((entries, valid_len))
}

/// Truncate bytes past the last complete record. Returns how many were dropped.
fn repair_tail(path: &Path) -> anyhow::Result<u64> {
    let (_, valid_len) = read_log_entries(path)?;
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let actual_len = file.metadata()?.len();
    if actual_len <= valid_len {
        return Ok(0);
    }
    file.set_len(valid_len).context("truncate torn request log")?;
    file.sync_all()?;
    Ok(actual_len - valid_len)
}

/// Replace the log with `entries` via temp file + rename.
fn rewrite_log(path: &Path, entries: &[Request]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("log.tmp");
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .context("open request log temp")?;
    for entry in entries {
        let payload = serde_json::to_vec(entry).context("encode request")?;
        write_record(&mut out, &payload)?;
    }
    out.flush()?;
    out.sync_all()?;
    fs::rename(&tmp_path, path).context("replace request log")?;
    Ok(())
}
