//! Fixed-capacity sample buffer with overwrite counting.
//!
//! Each channel buffers samples between two writes in a [`RingBuffer`]. The
//! producer (a data source callback) never blocks: when the buffer is full the
//! oldest sample is dropped and [`RingBuffer::overwrites`] goes up.
//!
//! # Layout
//! ```text
//! capacity N  ->  N + 1 slots
//!
//!   tail                head
//!    v                   v
//!  [ s0 | s1 | s2 | .. | -- | .. ]
//! ```
//! One slot always stays empty so that `head == tail` means "empty" and never
//! "full".

/// Circular FIFO of `T` holding up to `capacity()` elements.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    overwrites: usize,
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RingBuffer<T> {
    /// Unallocated buffer; every push counts as an overwrite until [`allocate`](Self::allocate).
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: 0,
            tail: 0,
            overwrites: 0,
        }
    }

    /// Buffer holding up to `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.allocate(capacity);
        buffer
    }

    /// Drop all contents and resize to hold `capacity` elements.
    pub fn allocate(&mut self, capacity: usize) {
        self.slots = std::iter::repeat_with(|| None).take(capacity + 1).collect();
        self.head = 0;
        self.tail = 0;
        self.overwrites = 0;
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// Number of buffered elements.
    pub fn count(&self) -> usize {
        let len = self.slots.len();
        if len == 0 {
            return 0;
        }
        (self.head + len - self.tail) % len
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Elements dropped because the buffer was full, since the last reset.
    pub fn overwrites(&self) -> usize {
        self.overwrites
    }

    /// Return the overwrite count and start counting from zero; contents are kept.
    pub fn take_overwrites(&mut self) -> usize {
        std::mem::take(&mut self.overwrites)
    }

    /// Append `value`, dropping the oldest element if full.
    pub fn push(&mut self, value: T) {
        let len = self.slots.len();
        if len <= 1 {
            self.overwrites += 1;
            return;
        }
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % len;
        if self.head == self.tail {
            self.slots[self.tail] = None;
            self.tail = (self.tail + 1) % len;
            self.overwrites += 1;
        }
    }

    /// Element `i`, counting from the oldest.
    pub fn peek(&self, i: usize) -> Option<&T> {
        if i >= self.count() {
            return None;
        }
        let len = self.slots.len();
        self.slots[(self.tail + i) % len].as_ref()
    }

    /// Most recently pushed element.
    pub fn newest(&self) -> Option<&T> {
        self.count().checked_sub(1).and_then(|i| self.peek(i))
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        value
    }

    /// Empty the buffer and clear the overwrite count; capacity is kept.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
        self.overwrites = 0;
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count()).filter_map(move |i| self.peek(i))
    }
}
