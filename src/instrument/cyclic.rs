//! Background acquisition for instruments that report values on their own
//! schedule.

use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use heapless::Vec as BoundedVec;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Longest record kept while waiting for its terminator.
pub const RECORD_CAPACITY: usize = 4096;

/// Reassembles terminator-delimited records from arbitrarily fragmented
/// reads. The incomplete tail of one read is kept for the next. A record
/// longer than [`RECORD_CAPACITY`] is dropped up to its terminator.
pub struct RecordAccumulator {
    buffer: BoundedVec<u8, RECORD_CAPACITY>,
    terminator: Vec<u8>,
    discarding: bool,
}

impl RecordAccumulator {
    pub fn new(terminator: &[u8]) -> Self {
        Self {
            buffer: BoundedVec::new(),
            terminator: terminator.to_vec(),
            discarding: false,
        }
    }

    /// Appends `bytes` and returns every record completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &byte in bytes {
            if self.buffer.is_full() {
                if !self.discarding {
                    warn!(capacity = RECORD_CAPACITY, "record overflow, skipping to the next terminator");
                    self.discarding = true;
                }
                self.keep_terminator_prefix();
            }
            if self.buffer.push(byte).is_err() {
                continue;
            }
            if !self.terminator.is_empty() && self.buffer.ends_with(&self.terminator) {
                let end = self.buffer.len() - self.terminator.len();
                let complete = !core::mem::take(&mut self.discarding);
                if complete {
                    let record = String::from_utf8_lossy(&self.buffer[..end]).trim().to_string();
                    if !record.is_empty() {
                        records.push(record);
                    }
                }
                self.buffer.clear();
            }
        }
        records
    }

    /// While discarding, only the bytes that could start a split terminator
    /// are worth keeping.
    fn keep_terminator_prefix(&mut self) {
        let keep = self.terminator.len().saturating_sub(1).min(self.buffer.len());
        let start = self.buffer.len() - keep;
        let tail = BoundedVec::from_slice(&self.buffer[start..]).unwrap_or_default();
        self.buffer = tail;
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

/// Splits a `key=value;key=value` record. Fields without `=` are skipped.
pub fn parse_record(record: &str) -> Vec<(String, String)> {
    record
        .split(';')
        .filter_map(|field| field.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// A thread that calls `tick` every interval until stopped or until `tick`
/// breaks.
pub struct CyclicWorker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    thread: ThreadId,
}

impl CyclicWorker {
    pub fn spawn<F>(name: String, interval: Duration, mut tick: F) -> Result<Self, TransportError>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let label = name.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            debug!(worker = %label, "cyclic acquisition started");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if tick().is_break() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(worker = %label, "cyclic acquisition stopped");
        })?;
        let thread = handle.thread().id();
        Ok(Self {
            stop,
            handle: Some(handle),
            thread,
        })
    }

    /// Signals the thread and waits for it, unless called from the worker
    /// itself.
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if thread::current().id() != self.thread {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fields() {
        assert_eq!(
            parse_record("temp=21.5; volt = 3.3;junk"),
            vec![("temp".to_string(), "21.5".to_string()), ("volt".to_string(), "3.3".to_string())]
        );
    }
}
