//! Binary min-heap with stable handles.
//!
//! Every inserted entry gets a [`HeapHandle`] that keeps pointing at it no
//! matter how it moves inside the heap, so a lease can be deleted or
//! re-keyed in O(log n) without a position-changed callback.

use crate::error::LeaseResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(usize);

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    handle: usize,
}

#[derive(Debug)]
pub struct ExpiryHeap<K, V> {
    nodes: Vec<Node<K, V>>,
    /// handle -> position in `nodes`
    positions: Vec<Option<usize>>,
    free: Vec<usize>,
}

impl<K: Ord, V> Default for ExpiryHeap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> ExpiryHeap<K, V> {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), positions: Vec::new(), free: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, key: K, value: V) -> LeaseResult<HeapHandle> {
        self.nodes.try_reserve(1)?;
        let handle = match self.free.pop() {
            Some(h) => h,
            None => {
                self.positions.try_reserve(1)?;
                self.positions.push(None);
                self.positions.len() - 1
            }
        };

        let pos = self.nodes.len();
        self.nodes.push(Node { key, value, handle });
        self.positions[handle] = Some(pos);
        self.sift_up(pos);
        Ok(HeapHandle(handle))
    }

    /// Delete the entry at `handle`, wherever it currently sits.
    pub fn remove(&mut self, handle: HeapHandle) -> Option<(K, V)> {
        let pos = self.positions.get_mut(handle.0)?.take()?;
        let last = self.nodes.len() - 1;
        self.nodes.swap(pos, last);
        let node = self.nodes.pop()?;
        self.free.push(handle.0);

        if pos < self.nodes.len() {
            let moved = self.nodes[pos].handle;
            self.positions[moved] = Some(pos);
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        Some((node.key, node.value))
    }

    /// Re-key an entry and restore heap order in whichever direction the
    /// new key requires. Returns false if the handle is not in this heap.
    pub fn update(&mut self, handle: HeapHandle, key: K) -> bool {
        let Some(pos) = self.position(handle) else {
            return false;
        };
        self.nodes[pos].key = key;
        let pos = self.sift_up(pos);
        self.sift_down(pos);
        true
    }

    /// Remove and return the minimum entry.
    pub fn pop(&mut self) -> Option<(K, V)> {
        let handle = HeapHandle(self.nodes.first()?.handle);
        self.remove(handle)
    }

    pub fn peek(&self) -> Option<(&K, &V)> {
        self.nodes.first().map(|n| (&n.key, &n.value))
    }

    pub fn get(&self, handle: HeapHandle) -> Option<(&K, &V)> {
        let pos = self.position(handle)?;
        let node = &self.nodes[pos];
        Some((&node.key, &node.value))
    }

    pub fn contains(&self, handle: HeapHandle) -> bool {
        self.position(handle).is_some()
    }

    /// Entries in internal (not sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.nodes.iter().map(|n| (&n.key, &n.value))
    }

    fn position(&self, handle: HeapHandle) -> Option<usize> {
        self.positions.get(handle.0).copied().flatten()
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.positions[self.nodes[a].handle] = Some(a);
        self.positions[self.nodes[b].handle] = Some(b);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.nodes[pos].key < self.nodes[parent].key {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.nodes.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.nodes[left].key < self.nodes[smallest].key {
                smallest = left;
            }
            if right < len && self.nodes[right].key < self.nodes[smallest].key {
                smallest = right;
            }
            if smallest == pos {
                return pos;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
