//! Ordered, id-keyed local view of a remote table slice.

/// Entities stored in a [`LocalCollection`] expose the id that keys them
/// within their table.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// An ordered sequence of entities with exactly one entry per id.
///
/// Insertion order is preserved for display; membership and
/// latest-value-per-id are the invariants that matter. Applying a stream of
/// change events in delivery order leaves the collection holding the last
/// delivered snapshot for every id that was inserted and not later deleted.
#[derive(Debug, Clone, Default)]
pub struct LocalCollection<T> {
    entries: Vec<T>,
}

impl<T: Keyed> LocalCollection<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.iter().find(|entry| entry.key() == id)
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Replace the whole collection from a point-in-time read.
    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.entries = rows;
    }

    /// Apply an insert event. Appends; if the id is already present the new
    /// snapshot wins and keeps the existing position.
    pub fn apply_insert(&mut self, row: T) {
        match self.position(row.key()) {
            Some(idx) => self.entries[idx] = row,
            None => self.entries.push(row),
        }
    }

    /// Apply an update event. Replaces in place; an update for an unknown id
    /// (delivered before the seed fetch landed) inserts instead.
    pub fn apply_update(&mut self, row: T) {
        self.apply_insert(row);
    }

    /// Apply a delete event. Removing a missing id is a no-op. Returns
    /// whether a row was removed.
    pub fn apply_delete(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key() != id);
        self.entries.len() != before
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key() == id)
    }
}

impl<T: Keyed + Clone> LocalCollection<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.clone()
    }
}
