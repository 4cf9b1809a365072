// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The lock-striped stream registry
//!
//! Stream ids of one parity are dense, so striping on `id >> 1` spreads
//! consecutive streams across shards. The per-side active counts are
//! reserved before the shard insert so a capacity check and the insert are
//! atomic as a pair.

use crate::{stream::Stream, sync::lock};
use hashbrown::hash_map::{Entry, HashMap};
use s2n_http2_core::stream::StreamId;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};

const SHARD_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InsertError {
    /// The id is already registered
    Duplicate,
    /// The side's concurrent-stream cap was reached
    AtCapacity,
}

pub(crate) struct StreamMap {
    shards: [Mutex<HashMap<u32, Arc<Stream>>>; SHARD_COUNT],
    local_count: AtomicI64,
    remote_count: AtomicI64,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            shards: core::array::from_fn(|_| Mutex::new(HashMap::new())),
            local_count: AtomicI64::new(0),
            remote_count: AtomicI64::new(0),
        }
    }

    #[inline]
    fn shard(&self, id: StreamId) -> &Mutex<HashMap<u32, Arc<Stream>>> {
        &self.shards[(id.as_u32() as usize >> 1) % SHARD_COUNT]
    }

    #[inline]
    fn count(&self, local: bool) -> &AtomicI64 {
        if local {
            &self.local_count
        } else {
            &self.remote_count
        }
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        lock(self.shard(id)).get(&id.as_u32()).cloned()
    }

    /// Inserts a stream, counting it against `max` for its side
    ///
    /// A negative `max` disables the cap.
    pub fn insert(&self, stream: Arc<Stream>, max: i64) -> Result<(), InsertError> {
        let count = self.count(stream.is_local());

        // reserve the count slot before touching the shard so the cap check
        // and the insert cannot interleave with other insertions
        let mut current = count.load(Ordering::Acquire);
        loop {
            if max >= 0 && current >= max {
                return Err(InsertError::AtCapacity);
            }
            match count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let id = stream.id();
        match lock(self.shard(id)).entry(id.as_u32()) {
            Entry::Occupied(_) => {
                count.fetch_sub(1, Ordering::AcqRel);
                Err(InsertError::Duplicate)
            }
            Entry::Vacant(slot) => {
                slot.insert(stream);
                Ok(())
            }
        }
    }

    /// Removes a stream, decrementing its side's count with it
    pub fn remove(&self, id: StreamId) -> Option<Arc<Stream>> {
        let removed = lock(self.shard(id)).remove(&id.as_u32());
        if let Some(stream) = &removed {
            self.count(stream.is_local()).fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn local_count(&self) -> i64 {
        self.local_count.load(Ordering::Acquire)
    }

    pub fn remote_count(&self) -> i64 {
        self.remote_count.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Visits every registered stream
    ///
    /// Shards are visited in order while their lock is held; the callback
    /// must only touch lock-free stream state.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Stream>)) {
        for shard in &self.shards {
            for stream in lock(shard).values() {
                f(stream);
            }
        }
    }

    /// Empties the registry, returning every stream that was registered
    pub fn drain(&self) -> Vec<Arc<Stream>> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = lock(shard);
            for (_, stream) in shard.drain() {
                self.count(stream.is_local()).fetch_sub(1, Ordering::AcqRel);
                drained.push(stream);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: u32, local: bool) -> Arc<Stream> {
        Stream::new(StreamId::new_truncated(id), local, 65_535, 65_535)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let map = StreamMap::new();
        map.insert(stream(3, false), -1).unwrap();
        assert_eq!(
            map.insert(stream(3, false), -1),
            Err(InsertError::Duplicate)
        );
        assert_eq!(map.remote_count(), 1);
    }

    #[test]
    fn capacity_is_enforced_per_side() {
        let map = StreamMap::new();
        map.insert(stream(1, false), 2).unwrap();
        map.insert(stream(3, false), 2).unwrap();
        assert_eq!(
            map.insert(stream(5, false), 2),
            Err(InsertError::AtCapacity)
        );

        // the local side has its own count
        map.insert(stream(2, true), 2).unwrap();
        assert_eq!(map.remote_count(), 2);
        assert_eq!(map.local_count(), 1);
    }

    #[test]
    fn removal_frees_capacity() {
        let map = StreamMap::new();
        map.insert(stream(1, false), 1).unwrap();
        assert!(map.insert(stream(3, false), 1).is_err());

        assert!(map.remove(StreamId::new_truncated(1)).is_some());
        map.insert(stream(3, false), 1).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn concurrent_inserts_respect_the_cap() {
        use std::thread;

        let map = Arc::new(StreamMap::new());
        let mut handles = Vec::new();
        for worker in 0..4 {
            let map = map.clone();
            handles.push(thread::spawn(move || {
                let mut accepted = 0;
                for n in 0..64 {
                    let id = 1 + 2 * (worker * 64 + n);
                    if map.insert(stream(id, false), 100).is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }

        let accepted: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 100);
        assert_eq!(map.remote_count(), 100);
        assert_eq!(map.len(), 100);
    }
}
