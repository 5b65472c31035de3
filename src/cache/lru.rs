use std::collections::HashMap;

use super::{Cache, Eviction};
use crate::types::PageNum;

const NIL: usize = usize::MAX;

struct Node<V> {
    key: PageNum,
    value: V,
    prev: usize,
    next: usize,
}

/// Classic LRU over a hash map and an intrusive doubly linked list of
/// slot indices. Head is most recently used, tail is the victim.
pub struct LruCache<V> {
    capacity: usize,
    map: HashMap<PageNum, usize>,
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    on_evict: Option<Eviction<V>>,
}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            on_evict: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn evict_oldest(&mut self) {
        let victim = self.tail;
        if victim == NIL {
            return;
        }
        self.detach(victim);
        let key = self.nodes[victim].key;
        let value = self.nodes[victim].value.clone();
        self.map.remove(&key);
        self.free.push(victim);
        if let Some(cb) = &self.on_evict {
            cb(key, value);
        }
    }
}

impl<V: Clone + Send> Cache<V> for LruCache<V> {
    fn get(&mut self, key: PageNum) -> Option<V> {
        let idx = *self.map.get(&key)?;
        self.detach(idx);
        self.attach_front(idx);
        Some(self.nodes[idx].value.clone())
    }

    fn put(&mut self, key: PageNum, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = value;
            self.detach(idx);
            self.attach_front(idx);
            return;
        }

        if self.map.len() >= self.capacity {
            self.evict_oldest();
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Node {
                    key,
                    value,
                    prev: NIL,
                    next: NIL,
                };
                idx
            }
            None => {
                self.nodes.push(Node {
                    key,
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.attach_front(idx);
    }

    fn remove(&mut self, key: PageNum) -> Option<V> {
        let idx = self.map.remove(&key)?;
        self.detach(idx);
        self.free.push(idx);
        Some(self.nodes[idx].value.clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn entries(&self) -> Vec<(PageNum, V)> {
        self.map
            .iter()
            .map(|(&key, &idx)| (key, self.nodes[idx].value.clone()))
            .collect()
    }

    fn set_eviction(&mut self, eviction: Eviction<V>) {
        self.on_evict = Some(eviction);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_evicts_in_lru_order() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&evicted);

        let mut cache: LruCache<u64> = LruCache::new(2);
        cache.set_eviction(Box::new(move |key, _| {
            log.lock().unwrap().push(key);
        }));

        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(*evicted.lock().unwrap(), vec![1]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache: LruCache<u64> = LruCache::new(2);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.get(1), Some(10));
        cache.put(3, 30);

        // 2 was the coldest entry after the get of 1
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(1), Some(10));
        assert_eq!(cache.get(3), Some(30));
    }

    #[test]
    fn test_put_overwrites() {
        let mut cache: LruCache<u64> = LruCache::new(2);
        cache.put(1, 10);
        cache.put(1, 11);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1), Some(11));
    }

    #[test]
    fn test_remove() {
        let mut cache: LruCache<u64> = LruCache::new(2);
        cache.put(1, 10);
        assert_eq!(cache.remove(1), Some(10));
        assert_eq!(cache.len(), 0);
        assert!(cache.get(1).is_none());
    }
}
