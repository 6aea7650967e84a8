//! # Pipes
//!
//! Anonymous unidirectional byte channels backed by an in-memory ring
//! buffer, the backing of the `pipe` syscall.
//!
//! A pipe is two `File` handles over one shared buffer. The handles are
//! refcounted the same way every open file is: `dup` and process
//! spawning clone the `Arc`, and an end counts as open until the last
//! descriptor referencing it goes away. A reader on an empty pipe blocks
//! until data arrives or every writer is gone (then end-of-file); a
//! writer on a full pipe blocks until space opens up or every reader is
//! gone (then broken pipe).

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::config::PIPE_BUFFER_SIZE;
use crate::sched::CondVar;

use super::{File, FsError, Stat, S_IFIFO};

struct PipeState {
    buffer: VecDeque<u8>,
    read_end_open: bool,
    write_end_open: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    /// Readers wait here for bytes or writer close.
    readable: CondVar,
    /// Writers wait here for space or reader close.
    writable: CondVar,
}

/// Creates a connected pipe, returning `(read_end, write_end)`.
pub fn new_pipe() -> (Arc<dyn File>, Arc<dyn File>) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buffer: VecDeque::with_capacity(PIPE_BUFFER_SIZE),
            read_end_open: true,
            write_end_open: true,
        }),
        readable: CondVar::new(),
        writable: CondVar::new(),
    });
    (
        Arc::new(PipeReader {
            shared: shared.clone(),
        }),
        Arc::new(PipeWriter { shared }),
    )
}

fn pipe_stat() -> Stat {
    Stat {
        st_mode: S_IFIFO | 0o600,
        st_blksize: PIPE_BUFFER_SIZE as u32,
        ..Stat::default()
    }
}

struct PipeReader {
    shared: Arc<PipeShared>,
}

impl File for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                for slot in buf[..n].iter_mut() {
                    *slot = state.buffer.pop_front().unwrap_or_default();
                }
                // Space opened up for blocked writers
                self.shared.writable.broadcast();
                return Ok(n);
            }
            if !state.write_end_open {
                // Every writer is gone: end of file
                return Ok(0);
            }
            state = self.shared.readable.wait(state, &self.shared.state);
        }
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::BadDescriptor)
    }

    fn lseek(&self, _offset: i64, _whence: u32) -> Result<i64, FsError> {
        Err(FsError::IllegalSeek)
    }

    fn fstat(&self) -> Result<Stat, FsError> {
        Ok(pipe_stat())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.state.lock().read_end_open = false;
        // Blocked writers must learn the pipe broke
        self.shared.writable.broadcast();
    }
}

struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl File for PipeWriter {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::BadDescriptor)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if !state.read_end_open {
                return Err(FsError::BrokenPipe);
            }
            let space = PIPE_BUFFER_SIZE - state.buffer.len();
            if space > 0 {
                let n = buf.len().min(space);
                state.buffer.extend(&buf[..n]);
                self.shared.readable.broadcast();
                return Ok(n);
            }
            state = self.shared.writable.wait(state, &self.shared.state);
        }
    }

    fn lseek(&self, _offset: i64, _whence: u32) -> Result<i64, FsError> {
        Err(FsError::IllegalSeek)
    }

    fn fstat(&self) -> Result<Stat, FsError> {
        Ok(pipe_stat())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.state.lock().write_end_open = false;
        // Blocked readers must see the end of file
        self.shared.readable.broadcast();
    }
}
