//! Console line retention for websocket replay.

use std::{collections::VecDeque, sync::Mutex};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A bounded ring of the most recent console lines.
///
/// The live fan-out happens on the broadcast channel; this buffer only exists
/// so that a freshly connected websocket can replay recent history.
pub struct ConsoleBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConsoleBuffer {
    /// Creates a buffer retaining up to `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a line, evicting the oldest once full.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("console buffer lock poisoned");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Returns up to `count` of the most recent lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("console buffer lock poisoned");
        lines
            .iter()
            .skip(lines.len().saturating_sub(count))
            .cloned()
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_keeps_most_recent() {
        let buffer = ConsoleBuffer::new(3);
        for line in ["a", "b", "c", "d"] {
            buffer.push(line.to_string());
        }

        assert_eq!(buffer.recent(10), vec!["b", "c", "d"]);
        assert_eq!(buffer.recent(2), vec!["c", "d"]);
    }
}
