use crate::error::{ConfigError, WindowError};

/// Fixed capacity store holding the most recently pushed items.
///
/// Once full, every push overwrites the oldest slot in place, dropping its
/// previous occupant. Items are addressed by recency: offset `0` is the item
/// written by the last push, offset `1` the one before it, and so on.
#[derive(Debug, Clone)]
pub struct FrameWindow<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Slot written by the last push.
    cursor: usize,
}

impl<T> FrameWindow<T> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity(capacity));
        }

        Ok(Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        })
    }

    pub fn push(&mut self, item: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(item);
            self.cursor = self.slots.len() - 1;
        } else {
            self.cursor = (self.cursor + 1) % self.capacity;
            self.slots[self.cursor] = item;
        }
    }

    pub fn most_recent(&self) -> Option<&T> {
        self.slots.get(self.cursor)
    }

    pub fn most_recent_mut(&mut self) -> Option<&mut T> {
        self.slots.get_mut(self.cursor)
    }

    /// The item pushed `offset` pushes before the most recent one.
    pub fn by_recency(&self, offset: usize) -> Result<&T, WindowError> {
        let slot = self.slot(offset)?;
        Ok(&self.slots[slot])
    }

    pub fn by_recency_mut(&mut self, offset: usize) -> Result<&mut T, WindowError> {
        let slot = self.slot(offset)?;
        Ok(&mut self.slots[slot])
    }

    /// Borrow one item for reading and another, distinct one for writing.
    pub fn pair_mut(&mut self, read: usize, write: usize) -> Result<(&T, &mut T), WindowError> {
        if read == write {
            return Err(WindowError::Aliased(read));
        }

        let (read, write) = (self.slot(read)?, self.slot(write)?);
        if read < write {
            let (head, tail) = self.slots.split_at_mut(write);
            Ok((&head[read], &mut tail[0]))
        } else {
            let (head, tail) = self.slots.split_at_mut(read);
            Ok((&tail[0], &mut head[write]))
        }
    }

    /// Items from newest to oldest.
    pub fn iter_by_recency(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len()).map(move |offset| &self.slots[self.wrap(offset)])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, offset: usize) -> Result<usize, WindowError> {
        if offset >= self.len() {
            return Err(WindowError::OutOfRange {
                offset,
                len: self.len(),
            });
        }
        Ok(self.wrap(offset))
    }

    // walk back `offset` slots from the cursor, wrapping at the storage boundary
    fn wrap(&self, offset: usize) -> usize {
        let len = self.len();
        (self.cursor + len - offset) % len
    }
}
