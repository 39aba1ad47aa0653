//! Scripted in-memory interface
//!
//! [`ScriptedInterface`] feeds a fixed sequence of read results to the pump
//! and records everything written back. The paired [`ScriptControl`] lets a
//! test inspect and extend that state while the pump runs on another thread.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::interface::{InterfaceReader, InterfaceWriter, VirtualInterface};

/// One scripted result for a read call.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Deliver these packet bytes
    Packet(Vec<u8>),
    /// Report a timeout (`Ok(0)`)
    Empty,
    /// Fail with an error of this kind
    Error(io::ErrorKind),
    /// Fail with this raw errno
    Os(i32),
}

#[derive(Default)]
struct ScriptState {
    reads: VecDeque<ReadStep>,
    read_calls: usize,
    read_timeouts: Vec<Duration>,
    writes: Vec<Vec<u8>>,
    written: Vec<u8>,
    max_write_chunk: Option<usize>,
    write_errors: VecDeque<ReadStep>,
    opens: usize,
    fail_open: bool,
    readers_closed: usize,
    writers_closed: usize,
}

type Shared = Arc<Mutex<ScriptState>>;

fn lock(state: &Shared) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn step_error(step: ReadStep) -> io::Error {
    match step {
        ReadStep::Os(errno) => io::Error::from_raw_os_error(errno),
        ReadStep::Error(kind) => io::Error::from(kind),
        _ => io::Error::other("scripted failure"),
    }
}

/// Virtual interface driven by a read script.
pub struct ScriptedInterface {
    state: Shared,
}

/// Test-side handle onto a [`ScriptedInterface`].
#[derive(Clone)]
pub struct ScriptControl {
    state: Shared,
}

impl ScriptedInterface {
    pub fn new(steps: impl IntoIterator<Item = ReadStep>) -> (Self, ScriptControl) {
        let state = Arc::new(Mutex::new(ScriptState {
            reads: steps.into_iter().collect(),
            ..Default::default()
        }));
        (
            ScriptedInterface {
                state: Arc::clone(&state),
            },
            ScriptControl { state },
        )
    }

    /// Interface whose reads only ever time out
    pub fn idle() -> (Self, ScriptControl) {
        Self::new([])
    }
}

impl VirtualInterface for ScriptedInterface {
    type Reader = ScriptedReader;
    type Writer = ScriptedWriter;

    fn open_channels(&mut self) -> io::Result<(ScriptedReader, ScriptedWriter)> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.opens += 1;
        Ok((
            ScriptedReader {
                state: Arc::clone(&self.state),
            },
            ScriptedWriter {
                state: Arc::clone(&self.state),
            },
        ))
    }
}

/// Read channel of a [`ScriptedInterface`].
pub struct ScriptedReader {
    state: Shared,
}

impl InterfaceReader for ScriptedReader {
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let step = {
            let mut state = lock(&self.state);
            state.read_calls += 1;
            state.read_timeouts.push(timeout);
            state.reads.pop_front()
        };

        match step {
            Some(ReadStep::Packet(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(ReadStep::Empty) => Ok(0),
            Some(step) => Err(step_error(step)),
            None => {
                // Exhausted script behaves like a quiet device
                thread::sleep(timeout.min(Duration::from_millis(1)));
                Ok(0)
            }
        }
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        lock(&self.state).readers_closed += 1;
    }
}

/// Write channel of a [`ScriptedInterface`].
pub struct ScriptedWriter {
    state: Shared,
}

impl InterfaceWriter for ScriptedWriter {
    fn write_packet(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if let Some(step) = state.write_errors.pop_front() {
            return Err(step_error(step));
        }
        let n = state.max_write_chunk.map_or(buf.len(), |max| max.min(buf.len()));
        state.writes.push(buf[..n].to_vec());
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Drop for ScriptedWriter {
    fn drop(&mut self) {
        lock(&self.state).writers_closed += 1;
    }
}

impl ScriptControl {
    /// Append a packet to the read script
    pub fn push_read(&self, packet: Vec<u8>) {
        lock(&self.state).reads.push_back(ReadStep::Packet(packet));
    }

    /// Append an arbitrary step to the read script
    pub fn push_step(&self, step: ReadStep) {
        lock(&self.state).reads.push_back(step);
    }

    /// Fail the next write with `step` (an `Error` or `Os` step)
    pub fn fail_next_write(&self, step: ReadStep) {
        lock(&self.state).write_errors.push_back(step);
    }

    /// Accept at most `max` bytes per write call
    pub fn set_max_write_chunk(&self, max: usize) {
        lock(&self.state).max_write_chunk = Some(max);
    }

    /// Make `open_channels` fail
    pub fn fail_open(&self) {
        lock(&self.state).fail_open = true;
    }

    pub fn pending_reads(&self) -> usize {
        lock(&self.state).reads.len()
    }

    pub fn read_calls(&self) -> usize {
        lock(&self.state).read_calls
    }

    /// Timeout passed to every read call, in order
    pub fn read_timeouts(&self) -> Vec<Duration> {
        lock(&self.state).read_timeouts.clone()
    }

    /// Every write call's accepted bytes, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes.len()
    }

    /// All accepted bytes concatenated
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn readers_closed(&self) -> usize {
        lock(&self.state).readers_closed
    }

    pub fn writers_closed(&self) -> usize {
        lock(&self.state).writers_closed
    }
}
