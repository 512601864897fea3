use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-service cyclic cursor. Survives instance list replacement, so the
/// rotation continues where it left off.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    counter: AtomicUsize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index in `[0, len)`. `None` for an empty list.
    pub fn next(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_in_order() {
        let cursor = RoundRobinCursor::new();
        let picks: Vec<usize> = (0..7).filter_map(|_| cursor.next(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_uniform_over_any_window() {
        let cursor = RoundRobinCursor::new();
        let k = 4;
        // Start mid-cycle: any window of k consecutive picks covers all k.
        cursor.next(k);
        let mut seen: Vec<usize> = (0..k).filter_map(|_| cursor.next(k)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty() {
        assert!(RoundRobinCursor::new().next(0).is_none());
    }
}
