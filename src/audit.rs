//! Append-only audit sink.
//!
//! `Log` is the single entry point; everything else in the core calls it,
//! never touching the writer directly. Durability is best-effort: writes
//! are flushed to the underlying writer's buffer before returning, with
//! no fsync. If a stronger guarantee is ever required it must be added
//! here, not worked around by callers.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub username: String,
    pub action: String,
    pub resource: String,
    pub metadata: Value,
}

impl AuditRecord {
    fn approx_size(&self) -> usize {
        // Rough JSON-line size estimate for the memory-bounded ring;
        // exactness doesn't matter, only monotonicity with record size.
        self.username.len() + self.action.len() + self.resource.len() + self.metadata.to_string().len() + 64
    }
}

enum Writer {
    Stdout(Stdout),
    File(File),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Stdout(w) => w.write(buf),
            Writer::File(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Stdout(w) => w.flush(),
            Writer::File(w) => w.flush(),
        }
    }
}

/// Single append-only audit stream plus a bounded in-memory ring of the
/// most recent entries, for the admin "recent logs" query.
pub struct AuditSink {
    writer: Mutex<Writer>,
    ring: Mutex<Ring>,
}

struct Ring {
    entries: VecDeque<AuditRecord>,
    bytes: usize,
    max_bytes: usize,
}

impl AuditSink {
    pub fn open(path: &str, max_ring_bytes: usize) -> io::Result<Self> {
        let writer = if path == "-" || path == "stdout" {
            Writer::Stdout(io::stdout())
        } else {
            Writer::File(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            )
        };

        Ok(Self {
            writer: Mutex::new(writer),
            ring: Mutex::new(Ring {
                entries: VecDeque::new(),
                bytes: 0,
                max_bytes: max_ring_bytes,
            }),
        })
    }

    /// `Log(user, action, resource, fields)`. Serializes to a single JSON
    /// line and flushes the writer's buffer before returning.
    pub fn log(&self, username: &str, action: &str, resource: &str, metadata: Value) {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            username: username.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            metadata,
        };

        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize audit record");
                return;
            }
        };

        {
            let mut w = self.writer.lock();
            if let Err(e) = writeln!(w, "{line}") {
                tracing::error!(error = %e, "failed to write audit record");
            }
            if let Err(e) = w.flush() {
                tracing::error!(error = %e, "failed to flush audit writer");
            }
        }

        let mut ring = self.ring.lock();
        let size = record.approx_size();
        ring.bytes += size;
        ring.entries.push_back(record);
        while ring.bytes > ring.max_bytes && ring.entries.len() > 1 {
            if let Some(evicted) = ring.entries.pop_front() {
                ring.bytes = ring.bytes.saturating_sub(evicted.approx_size());
            }
        }
    }

    /// Snapshot of the most recent in-memory entries, newest last.
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.ring.lock().entries.iter().cloned().collect()
    }
}
