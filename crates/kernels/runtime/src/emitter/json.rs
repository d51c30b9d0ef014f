//! Newline-delimited JSON emitter
//!
//! Each snapshot is written as one `{"time": .., "data": ..}` line.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use super::{Emitter, EmitterError, History, Result};
use crate::types::Value;

/// One emitted line.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    time: f64,
    data: Value,
}

/// Writes snapshots to any writer, one JSON object per line.
///
/// Snapshots are kept in memory as well so that `get_data()` works without
/// re-reading the output.
pub struct JsonEmitter<W: Write + Send> {
    writer: W,
    history: History,
    is_closed: bool,
}

impl<W: Write + Send> JsonEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            history: Vec::new(),
            is_closed: false,
        }
    }

    /// Consume the emitter and return its writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Emitter for JsonEmitter<W> {
    fn emit(&mut self, time: f64, data: &Value) -> Result<()> {
        if self.is_closed {
            return Err(EmitterError::AlreadyClosed);
        }
        let record = Record {
            time,
            data: data.clone(),
        };
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| EmitterError::Serialization(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        self.history.push((record.time, record.data));
        Ok(())
    }

    fn get_data(&self) -> History {
        self.history.clone()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.is_closed {
            return Err(EmitterError::AlreadyClosed);
        }
        self.flush()?;
        self.is_closed = true;
        Ok(())
    }
}

/// Read back the output of a [`JsonEmitter`]. Blank lines are skipped.
pub fn read_history(reader: impl BufRead) -> Result<History> {
    let mut history = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(&line).map_err(|e| EmitterError::Serialization(e.to_string()))?;
        history.push((record.time, record.data));
    }
    Ok(history)
}
