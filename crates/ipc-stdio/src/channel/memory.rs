//! In-process queue with the same semantics as the kernel transport.
//!
//! Capacity is counted in messages. Used by tests and by embedders that run
//! both ends of the bridge inside one process.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use bytes::Bytes;

use super::{ChannelError, Queue, Wait, check_len};

struct State {
    messages: VecDeque<Bytes>,
    closed: bool,
}

pub struct MemoryQueue {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave VecDeque half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Queue for MemoryQueue {
    fn send(&self, payload: &[u8], wait: Wait) -> Result<(), ChannelError> {
        check_len(payload)?;

        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.messages.len() < self.capacity {
                break;
            }
            match wait {
                Wait::NoWait => return Err(ChannelError::Full),
                Wait::Block => {
                    state = self
                        .writable
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }

        state.messages.push_back(Bytes::copy_from_slice(payload));
        self.readable.notify_one();
        Ok(())
    }

    fn recv(&self, wait: Wait) -> Result<Bytes, ChannelError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(msg) = state.messages.pop_front() {
                self.writable.notify_one();
                return Ok(msg);
            }
            match wait {
                Wait::NoWait => return Err(ChannelError::Empty),
                Wait::Block => {
                    state = self
                        .readable
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn destroy(&self) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.closed = true;
        state.messages.clear();
        self.readable.notify_all();
        self.writable.notify_all();
        Ok(())
    }
}
