//! Job id allocation.

use std::sync::Mutex;

/// Hands out increasing numeric job ids, wrapping back to 1 after `i64::MAX`.
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    last: Mutex<i64>,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `last`.
    pub fn starting_after(last: i64) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    pub fn next_id(&self) -> String {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if *last == i64::MAX {
            *last = 0;
        }
        *last += 1;
        last.to_string()
    }
}
