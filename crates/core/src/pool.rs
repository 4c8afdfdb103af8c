#![forbid(unsafe_code)]

/// LIFO free-list with a bounded depth. Keeps the packet hot path off the
/// allocator for node types that churn per flow.
#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Pool {
            free: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn take(&mut self) -> Option<T> {
        self.free.pop()
    }

    pub fn put(&mut self, item: T) {
        if self.free.len() < self.cap {
            self.free.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}
