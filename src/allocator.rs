use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::ChunkError;

/// Hands out chunk indices to the workers of one transfer.
///
/// Rejected indices are re-issued first, in the order they were rejected.
#[derive(Debug)]
pub struct ChunkAllocator {
    total: u64,
    state: Mutex<AllocatorState>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    next: u64,
    rejected: VecDeque<u64>,
}

impl ChunkAllocator {
    pub fn new(total: u64) -> Self {
        Self { total, state: Mutex::new(AllocatorState::default()) }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn next_chunk_id(&self) -> Result<u64, ChunkError> {
        let mut state = self.lock();
        if let Some(id) = state.rejected.pop_front() {
            return Ok(id);
        }
        if state.next < self.total {
            let id = state.next;
            state.next += 1;
            return Ok(id);
        }
        Err(ChunkError::NoMoreChunks)
    }

    pub fn reject_chunk_id(&self, id: u64) {
        if id >= self.total {
            return;
        }
        let mut state = self.lock();
        if !state.rejected.contains(&id) {
            state.rejected.push_back(id);
        }
    }

    /// Not yet issued plus waiting for re-issue.
    pub fn remaining(&self) -> u64 {
        let state = self.lock();
        (self.total - state.next) + state.rejected.len() as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        // A panicking worker never leaves the queue half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
