use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

/// Sliding windows of recent response times, one per endpoint address.
///
/// A sample is `None` when the endpoint didn't answer in that round. Windows are aligned by
/// round: the manager records one sample per endpoint per check cycle.
#[derive(Clone, Debug)]
pub struct LatencyHistory {
    // Size of the sliding window, also the number of rounds compared by `consistently_better`.
    capacity: usize,
    windows: HashMap<String, VecDeque<Option<Duration>>>,
}

impl LatencyHistory {
    /// Creates a new `LatencyHistory` keeping `capacity` samples per endpoint.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            windows: HashMap::new(),
        }
    }

    /// Returns the window size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a sample, evicting the oldest one once the window is full.
    pub fn record(&mut self, address: &str, sample: Option<Duration>) {
        let capacity = self.capacity;
        let window = self
            .windows
            .entry(address.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity + 1));
        window.push_back(sample);
        while window.len() > capacity {
            window.pop_front();
        }
    }

    /// Returns the samples of an endpoint, oldest first.
    pub fn samples(&self, address: &str) -> Vec<Option<Duration>> {
        self.windows
            .get(address)
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops the window of an endpoint.
    pub fn forget(&mut self, address: &str) {
        self.windows.remove(address);
    }

    /// Drops all windows.
    pub fn clear(&mut self) {
        self.windows.clear();
    }

    /// Checks whether `a` answered strictly faster than `b` in each of the last `capacity` rounds.
    ///
    /// A missing sample on either side in any of those rounds makes the answer `false`, as does
    /// a window that isn't full yet. An empty window size never reports improvement.
    pub fn consistently_better(&self, a: &str, b: &str) -> bool {
        let n = self.capacity;
        if n == 0 {
            return false;
        }
        let (Some(window_a), Some(window_b)) = (self.windows.get(a), self.windows.get(b)) else {
            return false;
        };
        if window_a.len() < n || window_b.len() < n {
            return false;
        }
        window_a
            .iter()
            .rev()
            .zip(window_b.iter().rev())
            .take(n)
            .all(|pair| matches!(pair, (Some(sa), Some(sb)) if sa < sb))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LatencyHistory;

    fn ms(millis: u64) -> Option<Duration> {
        Some(Duration::from_millis(millis))
    }

    #[test]
    fn test_window_is_bounded() {
        let mut history = LatencyHistory::new(3);
        for i in 0..10 {
            history.record("n1", ms(i));
            assert!(history.samples("n1").len() <= 3);
        }
        assert_eq!(history.samples("n1"), vec![ms(7), ms(8), ms(9)]);
    }

    #[test]
    fn test_forget_starts_empty() {
        let mut history = LatencyHistory::new(3);
        history.record("n1", ms(1));
        history.forget("n1");
        assert!(history.samples("n1").is_empty());
        history.record("n1", None);
        assert_eq!(history.samples("n1"), vec![None]);
    }

    #[test]
    fn test_consistently_better_requires_full_windows() {
        let mut history = LatencyHistory::new(3);
        for _ in 0..2 {
            history.record("fast", ms(1));
            history.record("slow", ms(9));
        }
        assert!(!history.consistently_better("fast", "slow"));
        history.record("fast", ms(1));
        history.record("slow", ms(9));
        assert!(history.consistently_better("fast", "slow"));
        assert!(!history.consistently_better("slow", "fast"));
        assert!(!history.consistently_better("fast", "unknown"));
    }

    #[test]
    fn test_consistently_better_scenarios() {
        let mut history = LatencyHistory::new(3);
        // Faster in only two of the last three rounds.
        for (a, b) in [(1, 5), (6, 5), (1, 5)] {
            history.record("a", ms(a));
            history.record("b", ms(b));
        }
        assert!(!history.consistently_better("a", "b"));
        // The slow round leaves the window after one more faster round.
        history.record("a", ms(2));
        history.record("b", ms(5));
        assert!(!history.consistently_better("a", "b"));
        history.record("a", ms(2));
        history.record("b", ms(5));
        assert!(history.consistently_better("a", "b"));
        // A missing sample on either side is inconclusive.
        history.record("a", ms(1));
        history.record("b", None);
        assert!(!history.consistently_better("a", "b"));
        assert!(!history.consistently_better("b", "a"));
    }

    #[test]
    fn test_ties_are_not_better() {
        let mut history = LatencyHistory::new(2);
        for _ in 0..2 {
            history.record("a", ms(4));
            history.record("b", ms(4));
        }
        assert!(!history.consistently_better("a", "b"));
        assert!(!history.consistently_better("b", "a"));
    }

    #[test]
    fn test_zero_capacity_never_switches() {
        let mut history = LatencyHistory::new(0);
        history.record("a", ms(1));
        history.record("b", ms(2));
        assert!(history.samples("a").is_empty());
        assert!(!history.consistently_better("a", "b"));
    }
}
