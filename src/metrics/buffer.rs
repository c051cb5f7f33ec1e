use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::Sample;

/// Default number of shards. Producers spread over shards round-robin, so
/// concurrent appends rarely contend on the same lock.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Thread-safe accumulator between producers and the aggregation cycle.
/// Producers call `append()`, the calc cycle calls `drain()`.
///
/// Each shard lock is held only for a `Vec` extend or a `mem::take`, so an
/// append never waits on aggregation work. A sample lands in exactly one
/// shard and is taken out of it by exactly one drain.
pub struct SampleBuffer {
    shards: Box<[Mutex<Vec<Sample>>]>,
    next: AtomicUsize,
}

impl SampleBuffer {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            shards,
            next: AtomicUsize::new(0),
        }
    }

    /// Hand a batch of samples over to the buffer.
    pub fn append(&self, batch: Vec<Sample>) {
        if batch.is_empty() {
            return;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let mut shard = self.shards[idx].lock();
        if shard.is_empty() {
            // Adopt the producer's allocation instead of copying into ours
            *shard = batch;
        } else {
            shard.extend(batch);
        }
    }

    /// Take everything accumulated so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Sample> {
        let mut out: Vec<Sample> = Vec::new();
        for shard in self.shards.iter() {
            let taken = std::mem::take(&mut *shard.lock());
            if out.is_empty() {
                out = taken;
            } else {
                out.extend(taken);
            }
        }
        out
    }

    /// Samples currently buffered (a moment-in-time estimate under load).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}
