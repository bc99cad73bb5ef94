use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// Structure which provides sequential IDs for requests and local instances
#[derive(Clone, Debug, Default)]
pub struct SequentialIdProvider {
    counter: Arc<AtomicI64>,
}

impl SequentialIdProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get next unique ID. IDs start from 1
    pub fn next_id(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}
