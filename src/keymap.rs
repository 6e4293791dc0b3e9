//! Sharded map from record key to the current buffer offset of the record
//! header. Writers and the compaction step both update it; sharding keeps
//! independent keys off each other's locks.

use std::collections::HashMap;

use parking_lot::Mutex;

pub const DEFAULT_SHARDS: usize = 32;

pub struct KeyMap {
    shards: Box<[Mutex<HashMap<u64, u64>>]>,
    mask: u64,
}

impl KeyMap {
    /// `shard_count` must be a power of two; the caller validates the range.
    pub fn new(shard_count: usize) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: shard_count as u64 - 1,
        }
    }

    pub fn store(&self, key: u64, pos: u64) {
        self.shard(key).lock().insert(key, pos);
    }

    pub fn load(&self, key: u64) -> Option<u64> {
        self.shard(key).lock().get(&key).copied()
    }

    pub fn load_and_delete(&self, key: u64) -> Option<u64> {
        self.shard(key).lock().remove(&key)
    }

    fn shard(&self, key: u64) -> &Mutex<HashMap<u64, u64>> {
        &self.shards[(key & self.mask) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_delete_round_trip() {
        let map = KeyMap::new(DEFAULT_SHARDS);
        for key in 0..200u64 {
            map.store(key, key * 7);
        }
        for key in 0..200u64 {
            assert_eq!(map.load(key), Some(key * 7));
        }
        assert_eq!(map.load_and_delete(13), Some(91));
        assert_eq!(map.load(13), None);
        assert_eq!(map.load_and_delete(13), None);
        // neighbours in the same shard survive the deletion
        assert_eq!(map.load(13 + DEFAULT_SHARDS as u64), Some((13 + 32) * 7));
    }

    #[test]
    fn store_overwrites_previous_position() {
        let map = KeyMap::new(16);
        map.store(42, 100);
        map.store(42, 900);
        assert_eq!(map.load(42), Some(900));
    }
}
