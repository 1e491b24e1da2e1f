//! Trailing-edge debounce of option edits
//!
//! Each key holds only its latest pending value and a deadline. A value is
//! released once its key has been quiet for the whole window, so a burst of
//! edits produces a single commit carrying the last value.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, (V, Instant)>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an edit; restarts the key's quiet period
    pub fn edit(&mut self, key: K, value: V, now: Instant) {
        self.pending.insert(key, (value, now + self.window));
    }

    /// Latest value waiting for `key`, if any
    pub fn pending(&self, key: &K) -> Option<&V> {
        self.pending.get(key).map(|(v, _)| v)
    }

    /// Remove and return the pending value for `key` ("apply now")
    pub fn take(&mut self, key: &K) -> Option<V> {
        self.pending.remove(key).map(|(v, _)| v)
    }

    /// Drop the pending value for `key` without committing it
    pub fn cancel(&mut self, key: &K) {
        self.pending.remove(key);
    }

    /// Remove and return every value whose quiet period has elapsed at `now`
    pub fn due(&mut self, now: Instant) -> Vec<(K, V)> {
        let ready: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|(v, _)| (k, v)))
            .collect()
    }

    /// Earliest deadline among pending keys
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, d)| *d).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_burst_coalesces_to_last_value() {
        let start = Instant::now();
        let mut d = Debouncer::new(WINDOW);

        // Typing "nginx" one keystroke at a time, 100ms apart
        for (i, text) in ["n", "ng", "ngi", "ngin", "nginx"].iter().enumerate() {
            let t = start + Duration::from_millis(100 * i as u64);
            d.edit("web:80", text.to_string(), t);
            assert!(d.due(t).is_empty(), "nothing may commit mid-burst");
        }

        // Still quiet-period pending just before the last deadline
        let last_edit = start + Duration::from_millis(400);
        assert!(d.due(last_edit + WINDOW - Duration::from_millis(1)).is_empty());

        let released = d.due(last_edit + WINDOW);
        assert_eq!(released, vec![("web:80", "nginx".to_string())]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let start = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.edit("a", 1, start);
        d.edit("b", 2, start + Duration::from_millis(300));

        assert_eq!(d.next_deadline(), Some(start + WINDOW));
        assert_eq!(d.due(start + WINDOW), vec![("a", 1)]);
        assert_eq!(d.next_deadline(), Some(start + Duration::from_millis(800)));
        assert_eq!(d.due(start + Duration::from_millis(800)), vec![("b", 2)]);
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_take_applies_immediately() {
        let now = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.edit("a", "v1", now);
        assert_eq!(d.pending(&"a"), Some(&"v1"));
        assert_eq!(d.take(&"a"), Some("v1"));
        assert!(d.due(now + WINDOW).is_empty());
    }

    #[test]
    fn test_cancel_discards() {
        let now = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.edit("a", 1, now);
        d.cancel(&"a");
        assert!(d.is_empty());
        assert!(d.due(now + WINDOW).is_empty());
    }
}
