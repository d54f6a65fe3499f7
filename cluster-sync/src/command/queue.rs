use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Command;

/// Unbounded FIFO of commands with one consumer and any number of producers.
pub struct CommandQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    commands: VecDeque<Command>,
    /// Bumped by every flush so waiting consumers can tell they were cancelled.
    flushes: u64,
}

impl CommandQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                commands: VecDeque::new(),
                flushes: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, command: Command) {
        self.state.lock().commands.push_back(command);
        self.available.notify_one();
    }

    /// Blocks until a command arrives, the timeout elapses or the queue is
    /// flushed. `None` or a zero timeout waits indefinitely.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Command> {
        let deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        let flushes = state.flushes;

        loop {
            if state.flushes != flushes {
                return None;
            }
            if let Some(command) = state.commands.pop_front() {
                return Some(command);
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        if state.flushes != flushes {
                            return None;
                        }
                        return state.commands.pop_front();
                    }
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.state.lock().commands.pop_front()
    }

    /// Discards every queued command and releases a blocked consumer with an
    /// empty result. Returns how many commands were dropped.
    pub fn flush(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.flushes += 1;
            let dropped = state.commands.len();
            state.commands.clear();
            dropped
        };
        self.available.notify_all();
        dropped
    }

    /// Snapshot only; another thread may push right after.
    pub fn is_empty(&self) -> bool {
        self.state.lock().commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
