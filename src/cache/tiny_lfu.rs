use std::collections::{HashMap, VecDeque};

use rand::Rng;

use super::{Cache, Eviction};
use crate::types::PageNum;

const SEEDS: [u64; 4] = [
    0xc3a5c85c97cb3127,
    0xb492b66fbe98f273,
    0x9ae16a3b2f90404f,
    0xcbf29ce484222325,
];

fn spread(key: PageNum) -> u64 {
    // splitmix64 finalizer; page numbers are sequential and need the
    // mixing before the per-seed multiply
    let mut h = key as u64;
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d049bb133111eb);
    h ^ (h >> 31)
}

/// Count-min sketch over 4-bit counters, two per byte. The add
/// counter halves every counter once the total passes 10x the
/// expected entry count, so stale popularity decays.
pub struct CountMinSketch {
    table_size: usize,
    table: Vec<u8>,
    count: usize,
    max_frequency: usize,
}

impl CountMinSketch {
    pub fn new(max_entries: usize) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let table_size = ((-(max_entries as f64) * (0.01f64).ln() / (ln2 * ln2)) as usize / 2).max(1);
        Self {
            table_size,
            table: vec![0u8; table_size],
            count: 0,
            max_frequency: max_entries.max(1) * 10,
        }
    }

    fn indexes(&self, key: PageNum) -> [usize; 4] {
        let h = spread(key);
        let mut out = [0usize; 4];
        for (i, seed) in SEEDS.iter().enumerate() {
            out[i] = (h.wrapping_mul(*seed) % self.table_size as u64) as usize;
        }
        out
    }

    fn nibble(&self, index: usize) -> u8 {
        if index & 1 == 1 {
            self.table[index] >> 4
        } else {
            self.table[index] & 0x0f
        }
    }

    fn bump(&mut self, index: usize) {
        if index & 1 == 1 {
            if self.table[index] >> 4 < 15 {
                self.table[index] += 0x10;
            }
        } else if self.table[index] & 0x0f < 15 {
            self.table[index] += 1;
        }
    }

    pub fn add(&mut self, key: PageNum) {
        self.count += 1;
        if self.count > self.max_frequency {
            self.reset();
        }
        for index in self.indexes(key) {
            self.bump(index);
        }
    }

    pub fn count(&self, key: PageNum) -> u32 {
        self.indexes(key)
            .iter()
            .map(|&index| self.nibble(index) as u32)
            .min()
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        for unit in self.table.iter_mut() {
            let lower = (*unit & 0x0f) >> 1;
            let upper = (*unit >> 4) >> 1;
            *unit = (upper << 4) | lower;
        }
        self.count >>= 1;
    }
}

struct Segment<V> {
    // front is most recently used
    order: VecDeque<PageNum>,
    map: HashMap<PageNum, V>,
}

impl<V> Segment<V> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn get(&self, key: PageNum) -> Option<&V> {
        self.map.get(&key)
    }

    fn touch(&mut self, key: PageNum) {
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
            self.order.push_front(key);
        }
    }

    fn push_front(&mut self, key: PageNum, value: V) {
        self.map.insert(key, value);
        self.order.push_front(key);
    }

    fn pop_back(&mut self) -> Option<(PageNum, V)> {
        let key = self.order.pop_back()?;
        let value = self.map.remove(&key)?;
        Some((key, value))
    }

    fn remove(&mut self, key: PageNum) -> Option<V> {
        let value = self.map.remove(&key)?;
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
        Some(value)
    }

    fn back(&self) -> Option<PageNum> {
        self.order.back().copied()
    }

    fn front(&self) -> Option<PageNum> {
        self.order.front().copied()
    }
}

/// W-TinyLFU: admissions land in a small window; the main region is
/// split into a probation segment and a protection segment for entries
/// that earned a second touch. Probation overflow is settled by
/// comparing sketch frequencies of the coldest entry against the
/// freshest candidate.
pub struct WTinyLfu<V> {
    window_size: usize,
    probation_size: usize,
    protection_size: usize,

    window: Segment<V>,
    probation: Segment<V>,
    protection: Segment<V>,

    sketch: CountMinSketch,
    on_evict: Option<Eviction<V>>,
}

impl<V: Clone> WTinyLfu<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        // window gets 2% of the capacity, probation 20% of the rest,
        // protection the remainder; every segment holds at least one
        // entry so small configurations stay usable
        let window_size = (capacity * 2 / 100).max(1);
        let rest = capacity.saturating_sub(window_size).max(2);
        let probation_size = (rest * 2 / 10).max(1);
        let protection_size = rest.saturating_sub(probation_size).max(1);
        Self {
            window_size,
            probation_size,
            protection_size,
            window: Segment::new(),
            probation: Segment::new(),
            protection: Segment::new(),
            sketch: CountMinSketch::new(capacity),
            on_evict: None,
        }
    }

    fn promote(&mut self, key: PageNum) {
        if let Some(value) = self.probation.remove(key) {
            self.protection.push_front(key, value);
            self.adjust();
        }
    }

    fn adjust(&mut self) {
        while self.window.len() > self.window_size {
            if let Some((key, value)) = self.window.pop_back() {
                self.probation.push_front(key, value);
            }
        }
        while self.protection.len() > self.protection_size {
            if let Some((key, value)) = self.protection.pop_back() {
                self.probation.push_front(key, value);
            }
        }
        while self.probation.len() > self.probation_size {
            let victim = self.probation.back();
            let candidate = self.probation.front();
            let (victim, candidate) = match (victim, candidate) {
                (Some(v), Some(c)) => (v, c),
                _ => break,
            };
            let loser = if self.evict_victim(victim, candidate) {
                victim
            } else {
                candidate
            };
            if let Some(value) = self.probation.remove(loser) {
                if let Some(cb) = &self.on_evict {
                    cb(loser, value);
                }
            }
        }
    }

    /// true means the cold victim goes, false keeps it and drops the
    /// candidate instead.
    fn evict_victim(&self, victim: PageNum, candidate: PageNum) -> bool {
        let victim_freq = self.sketch.count(victim);
        let candidate_freq = self.sketch.count(candidate);
        if victim_freq < candidate_freq {
            return true;
        }
        if candidate_freq <= 5 {
            return false;
        }
        rand::thread_rng().gen_bool(0.5)
    }
}

impl<V: Clone + Send> Cache<V> for WTinyLfu<V> {
    fn get(&mut self, key: PageNum) -> Option<V> {
        self.sketch.add(key);

        if let Some(value) = self.protection.get(key).cloned() {
            self.protection.touch(key);
            return Some(value);
        }
        if let Some(value) = self.probation.get(key).cloned() {
            self.promote(key);
            return Some(value);
        }
        if let Some(value) = self.window.get(key).cloned() {
            self.window.touch(key);
            return Some(value);
        }
        None
    }

    fn put(&mut self, key: PageNum, value: V) {
        self.sketch.add(key);

        if self.protection.get(key).is_some() {
            self.protection.map.insert(key, value);
            self.protection.touch(key);
            return;
        }
        if self.probation.get(key).is_some() {
            self.probation.map.insert(key, value);
            self.promote(key);
            return;
        }
        if self.window.get(key).is_some() {
            self.window.map.insert(key, value);
            self.window.touch(key);
            return;
        }

        self.window.push_front(key, value);
        self.adjust();
    }

    fn remove(&mut self, key: PageNum) -> Option<V> {
        self.window
            .remove(key)
            .or_else(|| self.probation.remove(key))
            .or_else(|| self.protection.remove(key))
    }

    fn len(&self) -> usize {
        self.window.len() + self.probation.len() + self.protection.len()
    }

    fn entries(&self) -> Vec<(PageNum, V)> {
        let mut out = Vec::with_capacity(self.len());
        for segment in [&self.window, &self.probation, &self.protection] {
            for (&key, value) in segment.map.iter() {
                out.push((key, value.clone()));
            }
        }
        out
    }

    fn set_eviction(&mut self, eviction: Eviction<V>) {
        self.on_evict = Some(eviction);
    }
}
