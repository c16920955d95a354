//! Journaled transactional containers.
//!
//! Every mutable piece of solver state is held in one of these wrappers so
//! that a speculative branch can be abandoned without corrupting anything.
//! Each container exposes the same protocol:
//!
//! - `shadow()` opens a transactional scope: subsequent writes are
//!   journaled;
//! - `commit()` closes the innermost scope, keeping its writes;
//! - `revert()` closes the innermost scope, undoing its writes in reverse
//!   order.
//!
//! Scopes nest; committing an inner scope folds its writes into the
//! enclosing scope, which may still revert them later. Closing a scope
//! that was never opened is a bug and asserts.
//!
//! The containers journal in place rather than layering a shadow object
//! over a locked parent: with a single object there is no parent handle to
//! write through while a scope is live, so the lock violation the original
//! protocol guards against cannot be expressed. The remaining misuse class
//! is unbalanced scopes, which the assertions catch.

use std::hash::Hash;

use fxhash::FxHashMap;

/// An append-only vector with transactional truncation.
#[derive(Debug, Clone)]
pub struct ShadowVec<T> {
    items: Vec<T>,
    marks: Vec<usize>,
}

impl<T> ShadowVec<T> {
    pub fn new() -> ShadowVec<T> {
        ShadowVec {
            items: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn shadow(&mut self) {
        self.marks.push(self.items.len());
    }

    pub fn commit(&mut self) {
        let mark = self.marks.pop();
        assert!(mark.is_some(), "commit without a live shadow");
    }

    pub fn revert(&mut self) {
        let mark = self.marks.pop().expect("revert without a live shadow");
        self.items.truncate(mark);
    }
}

impl<T> Default for ShadowVec<T> {
    fn default() -> ShadowVec<T> {
        ShadowVec::new()
    }
}

/// A LIFO work stack whose pushes *and* pops can be undone.
///
/// Unlike [`ShadowVec`], entries may be consumed inside a scope, so a
/// truncation mark is not enough: each operation is journaled and undone
/// individually on revert.
#[derive(Debug, Clone)]
pub struct ShadowQueue<T: Clone> {
    items: Vec<T>,
    journal: Vec<QueueOp<T>>,
    marks: Vec<usize>,
}

#[derive(Debug, Clone)]
enum QueueOp<T> {
    Pushed,
    Popped(T),
}

impl<T: Clone> ShadowQueue<T> {
    pub fn new() -> ShadowQueue<T> {
        ShadowQueue {
            items: Vec::new(),
            journal: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) {
        if !self.marks.is_empty() {
            self.journal.push(QueueOp::Pushed);
        }
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop()?;
        if !self.marks.is_empty() {
            self.journal.push(QueueOp::Popped(item.clone()));
        }
        Some(item)
    }

    pub fn shadow(&mut self) {
        self.marks.push(self.journal.len());
    }

    pub fn commit(&mut self) {
        let mark = self.marks.pop();
        assert!(mark.is_some(), "commit without a live shadow");
        if self.marks.is_empty() {
            self.journal.clear();
        }
    }

    pub fn revert(&mut self) {
        let mark = self.marks.pop().expect("revert without a live shadow");
        while self.journal.len() > mark {
            match self.journal.pop().unwrap() {
                QueueOp::Pushed => {
                    self.items.pop();
                }
                QueueOp::Popped(item) => self.items.push(item),
            }
        }
    }
}

impl<T: Clone> Default for ShadowQueue<T> {
    fn default() -> ShadowQueue<T> {
        ShadowQueue::new()
    }
}

/// A hash map whose insertions can be undone.
#[derive(Debug, Clone)]
pub struct ShadowMap<K: Eq + Hash + Clone, V: Clone> {
    map: FxHashMap<K, V>,
    journal: Vec<(K, Option<V>)>,
    marks: Vec<usize>,
}

impl<K: Eq + Hash + Clone, V: Clone> ShadowMap<K, V> {
    pub fn new() -> ShadowMap<K, V> {
        ShadowMap {
            map: FxHashMap::default(),
            journal: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let previous = self.map.insert(key.clone(), value);
        if !self.marks.is_empty() {
            self.journal.push((key, previous));
        }
    }

    pub fn shadow(&mut self) {
        self.marks.push(self.journal.len());
    }

    pub fn commit(&mut self) {
        let mark = self.marks.pop();
        assert!(mark.is_some(), "commit without a live shadow");
        if self.marks.is_empty() {
            self.journal.clear();
        }
    }

    pub fn revert(&mut self) {
        let mark = self.marks.pop().expect("revert without a live shadow");
        while self.journal.len() > mark {
            let (key, previous) = self.journal.pop().unwrap();
            match previous {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for ShadowMap<K, V> {
    fn default() -> ShadowMap<K, V> {
        ShadowMap::new()
    }
}

/// A single value with transactional assignment.
#[derive(Debug, Clone)]
pub struct ShadowCell<T: Copy> {
    value: T,
    journal: Vec<T>,
    marks: Vec<usize>,
}

impl<T: Copy> ShadowCell<T> {
    pub fn new(value: T) -> ShadowCell<T> {
        ShadowCell {
            value,
            journal: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn set(&mut self, value: T) {
        if !self.marks.is_empty() {
            self.journal.push(self.value);
        }
        self.value = value;
    }

    pub fn shadow(&mut self) {
        self.marks.push(self.journal.len());
    }

    pub fn commit(&mut self) {
        let mark = self.marks.pop();
        assert!(mark.is_some(), "commit without a live shadow");
        if self.marks.is_empty() {
            self.journal.clear();
        }
    }

    pub fn revert(&mut self) {
        let mark = self.marks.pop().expect("revert without a live shadow");
        while self.journal.len() > mark {
            self.value = self.journal.pop().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_commit_keeps_and_revert_discards() {
        let mut vec = ShadowVec::new();
        vec.push(1);

        vec.shadow();
        vec.push(2);
        vec.commit();
        assert_eq!(vec.len(), 2);

        vec.shadow();
        vec.push(3);
        vec.revert();
        assert_eq!(vec.len(), 2);
        assert_eq!(vec.get(1), Some(&2));
    }

    #[test]
    fn queue_revert_restores_popped_items() {
        let mut queue = ShadowQueue::new();
        queue.push("a");
        queue.push("b");

        queue.shadow();
        assert_eq!(queue.pop(), Some("b"));
        queue.push("c");
        queue.revert();

        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn map_revert_restores_overwritten_entries() {
        let mut map = ShadowMap::new();
        map.insert("x", 1);

        map.shadow();
        map.insert("x", 2);
        map.insert("y", 3);
        map.revert();

        assert_eq!(map.get(&"x"), Some(&1));
        assert_eq!(map.get(&"y"), None);
    }

    #[test]
    fn nested_scopes_commit_into_parent() {
        let mut vec = ShadowVec::new();
        vec.shadow();
        vec.push(1);
        vec.shadow();
        vec.push(2);
        vec.commit();
        // The inner commit folds into the outer scope, which then reverts
        // both writes.
        vec.revert();
        assert!(vec.is_empty());
    }

    #[test]
    fn cell_reverts_to_saved_value() {
        let mut cell = ShadowCell::new(10);
        cell.shadow();
        cell.set(11);
        cell.set(12);
        cell.revert();
        assert_eq!(cell.get(), 10);
    }

    #[test]
    #[should_panic(expected = "commit without a live shadow")]
    fn unbalanced_commit_asserts() {
        let mut vec: ShadowVec<u32> = ShadowVec::new();
        vec.commit();
    }
}
