// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory-backed medium shared between processes.
//!
//! Each key is a JSON file written atomically (tmp + rename). Every mutation
//! also appends one line to `journal.jsonl`; each handle tails the journal
//! from the offset it opened at and republishes lines written by other
//! origins. The journal is what makes set-then-clear markers observable: a
//! reader that wakes after the clear still sees both lines.
//!
//! Once the journal passes its size cap the next writer truncates it before
//! appending. Tails notice the shrink and restart from the top; the value
//! files stay authoritative, so only transient markers can be lost.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SharedMedium, StorageChange, CHANGE_CHANNEL_CAPACITY};

const JOURNAL_FILE: &str = "journal.jsonl";

/// Default polling fallback for the journal tail.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default journal size past which it is truncated.
const DEFAULT_JOURNAL_CAP: u64 = 64 * 1024;

/// Tuning for [`FileMedium`].
#[derive(Debug, Clone, Copy)]
pub struct FileMediumOptions {
    pub poll_interval: Duration,
    /// Journal size in bytes that triggers truncation on the next write.
    pub journal_cap: u64,
}

impl Default for FileMediumOptions {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, journal_cap: DEFAULT_JOURNAL_CAP }
    }
}

/// One line of the change journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    origin: String,
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// A handle on a shared state directory.
pub struct FileMedium {
    dir: PathBuf,
    origin: String,
    journal_cap: u64,
    tx: broadcast::Sender<StorageChange>,
}

impl FileMedium {
    /// Open (creating if needed) the medium rooted at `dir` and start tailing
    /// its journal until `shutdown` is cancelled. Must be called inside a
    /// Tokio runtime.
    pub fn open(dir: &Path, shutdown: CancellationToken) -> anyhow::Result<Arc<Self>> {
        Self::open_with(dir, FileMediumOptions::default(), shutdown)
    }

    pub fn open_with_poll_interval(
        dir: &Path,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        Self::open_with(dir, FileMediumOptions { poll_interval, ..Default::default() }, shutdown)
    }

    pub fn open_with(
        dir: &Path,
        options: FileMediumOptions,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let journal = dir.join(JOURNAL_FILE);
        let offset = match std::fs::metadata(&journal) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let origin = uuid::Uuid::new_v4().to_string();
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let tail = JournalTail {
            path: journal,
            offset,
            origin: origin.clone(),
            tx: tx.clone(),
            poll_interval: options.poll_interval,
        };
        tokio::spawn(tail.run(shutdown));

        debug!(dir = %dir.display(), origin = %origin, "file medium opened");
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            origin,
            journal_cap: options.journal_cap,
            tx,
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn append_journal(&self, key: &str, value: Option<&serde_json::Value>) -> anyhow::Result<()> {
        let entry = JournalEntry {
            origin: self.origin.clone(),
            key: key.to_owned(),
            value: value.cloned(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let path = self.journal_path();
        self.compact_journal(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        // Single write so concurrent appenders never interleave within a line.
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Truncate the journal once it has grown past the cap. Appenders use
    /// `O_APPEND`, so a racing write lands after the truncation, never inside.
    fn compact_journal(&self, path: &Path) -> anyhow::Result<()> {
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len < self.journal_cap {
            return Ok(());
        }
        debug!(path = %path.display(), len, "truncating journal");
        OpenOptions::new().write(true).open(path)?.set_len(0)?;
        Ok(())
    }
}

impl SharedMedium for FileMedium {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let path = self.value_path(key);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        write_atomic(&self.value_path(key), &serde_json::to_string_pretty(value)?)?;
        self.append_journal(key, Some(value))
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.value_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.append_journal(key, None)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

/// Write `contents` to `path` via a uniquely named temp file and rename.
///
/// The temp name carries PID and a counter so racing writers never share a
/// temp file.
fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Follows the journal and republishes entries from other origins.
struct JournalTail {
    path: PathBuf,
    offset: u64,
    origin: String,
    tx: broadcast::Sender<StorageChange>,
    poll_interval: Duration,
}

impl JournalTail {
    /// Read complete lines appended since the last read.
    fn read_new_entries(&mut self) -> anyhow::Result<Vec<JournalEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        // Journal was truncated or replaced: start over.
        if let Ok(meta) = file.metadata() {
            if meta.len() < self.offset {
                self.offset = 0;
            }
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;

        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 || !line.ends_with('\n') {
                // Partial line: leave it for the next read.
                break;
            }
            self.offset += bytes_read as u64;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %self.path.display(), "skipping bad journal line: {e}"),
            }
        }
        Ok(entries)
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }

            let entries = match self.read_new_entries() {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %self.path.display(), "journal read failed: {e}");
                    continue;
                }
            };
            for entry in entries {
                if entry.origin == self.origin {
                    continue;
                }
                let _ = self.tx.send(StorageChange { key: entry.key, value: entry.value });
            }
        }
        debug!(path = %self.path.display(), "journal tail stopped");
    }

    /// Watch the journal's directory; returns the watcher handle, which must
    /// stay alive for events to flow.
    fn setup_notify_watcher(&self, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;

        let watch_path = self.path.parent().unwrap_or(self.path.as_ref());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
