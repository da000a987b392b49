//! Append-only audit log with chain verification and rotation.

use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::event::{AuditEvent, AuditEventKind, GENESIS_PREV_HASH};

/// Default segment size before rotation (8 MiB).
const DEFAULT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Audit log failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Chain verification failed at a specific event
    #[error("audit chain broken at index {index}")]
    ChainBroken {
        /// First index at which the chain fails to verify
        index: u64,
    },

    /// Log file I/O failure
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted line could not be parsed
    #[error("audit parse error at line {line}: {source}")]
    Parse {
        /// 0-based line number
        line: usize,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

/// Tamper-evident audit log with a single writer.
///
/// Events are appended as one canonical-JSON line each. The writer keeps
/// the running tail hash so every append extends the chain; rotation
/// starts a new segment whose first event carries the previous segment's
/// tail hash as its `prev_hash`.
pub struct AuditLog {
    path: PathBuf,
    file: File,
    next_index: u64,
    last_hash: String,
    rotate_bytes: u64,
    bytes_written: u64,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`.
    ///
    /// An existing log is verified in full; a broken chain is fatal and
    /// reported with the exact failing index.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (next_index, last_hash, bytes) = if path.exists() {
            let events = Self::read_events(path)?;
            Self::verify_events(&events)?;
            let last_hash = events
                .last()
                .map(|e| e.this_hash.clone())
                .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
            let next_index = events.last().map(|e| e.index + 1).unwrap_or(0);
            let bytes = std::fs::metadata(path)?.len();
            (next_index, last_hash, bytes)
        } else {
            (0, GENESIS_PREV_HASH.to_string(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_index,
            last_hash,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            bytes_written: bytes,
        })
    }

    /// Override the rotation threshold.
    pub fn with_rotate_bytes(mut self, rotate_bytes: u64) -> Self {
        self.rotate_bytes = rotate_bytes;
        self
    }

    /// Append an event, extending the hash chain.
    pub fn append(
        &mut self,
        timestamp: u64,
        kind: AuditEventKind,
        actor: Option<String>,
        subject: Option<String>,
        detail: Value,
    ) -> Result<AuditEvent, AuditError> {
        if self.bytes_written >= self.rotate_bytes {
            self.rotate()?;
        }

        let event = AuditEvent::chained(
            self.next_index,
            self.last_hash.clone(),
            timestamp,
            kind,
            actor,
            subject,
            detail,
        );

        let line = serde_json::to_string(&event).map_err(|source| AuditError::Parse {
            line: self.next_index as usize,
            source,
        })?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;

        self.bytes_written += line.len() as u64 + 1;
        self.last_hash = event.this_hash.clone();
        self.next_index += 1;
        Ok(event)
    }

    /// Hash of the most recent event.
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Number of events appended so far across all segments.
    pub fn event_count(&self) -> u64 {
        self.next_index
    }

    /// Flush buffered writes to disk.
    pub fn sync(&mut self) -> Result<(), AuditError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Verify the chain in the active segment.
    ///
    /// Returns `ChainBroken { index }` at the first event whose hash or
    /// predecessor link fails; earlier events remain verified.
    pub fn verify_chain(path: &Path) -> Result<u64, AuditError> {
        let events = Self::read_events(path)?;
        Self::verify_events(&events)?;
        Ok(events.len() as u64)
    }

    fn verify_events(events: &[AuditEvent]) -> Result<(), AuditError> {
        let mut prev_hash: Option<&str> = None;
        for event in events {
            if let Some(prev) = prev_hash {
                if event.prev_hash != prev {
                    return Err(AuditError::ChainBroken { index: event.index });
                }
            }
            if !event.hash_is_consistent() {
                return Err(AuditError::ChainBroken { index: event.index });
            }
            prev_hash = Some(&event.this_hash);
        }
        Ok(())
    }

    fn read_events(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line).map_err(|source| {
                AuditError::Parse {
                    line: line_no,
                    source,
                }
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Rotate the active segment.
    ///
    /// The current file is renamed with a `.{first_index}-{last_index}`
    /// suffix and a fresh segment opened; the chain continues unbroken
    /// because the running tail hash carries over into the next append.
    fn rotate(&mut self) -> Result<(), AuditError> {
        self.file.flush()?;
        let rotated = self.path.with_extension(format!("log.{}", self.next_index));
        std::fs::rename(&self.path, &rotated)?;
        info!(segment = %rotated.display(), "rotated audit log segment");

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.bytes_written = 0;
        Ok(())
    }
}

/// Cloneable handle for appending audit events from any task.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditRequest>,
}

struct AuditRequest {
    timestamp: u64,
    kind: AuditEventKind,
    actor: Option<String>,
    subject: Option<String>,
    detail: Value,
}

impl AuditHandle {
    /// Record an event. Ordering and index assignment happen in the
    /// single writer task, so callers never contend on the log.
    pub async fn record(
        &self,
        timestamp: u64,
        kind: AuditEventKind,
        actor: Option<String>,
        subject: Option<String>,
        detail: Value,
    ) {
        let request = AuditRequest {
            timestamp,
            kind,
            actor,
            subject,
            detail,
        };
        if self.tx.send(request).await.is_err() {
            error!("audit writer task is gone; event dropped");
        }
    }
}

/// Spawn the single-writer audit task.
///
/// Returns the handle plus the join handle of the writer; the writer
/// drains its queue, syncs, and exits when every handle is dropped.
pub fn spawn_audit_writer(mut log: AuditLog) -> (AuditHandle, tokio::task::JoinHandle<AuditLog>) {
    let (tx, mut rx) = mpsc::channel::<AuditRequest>(1024);

    let join = tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            if let Err(e) = log.append(req.timestamp, req.kind, req.actor, req.subject, req.detail)
            {
                error!(error = %e, "failed to append audit event");
            }
        }
        if let Err(e) = log.sync() {
            error!(error = %e, "failed to sync audit log on shutdown");
        }
        log
    });

    (AuditHandle { tx }, join)
}
