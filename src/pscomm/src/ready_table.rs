use std::collections::HashMap;
use std::sync::Mutex;

/// Keyed countdown barrier. An entry becomes ready once `required`
/// contributions have arrived for its key and is removed on the reading
/// `is_ready` call; later contributions with the same key start a new
/// countdown.
pub struct ReadyTable {
    name: &'static str,
    required: usize,
    counts: Mutex<HashMap<u64, usize>>,
}

impl ReadyTable {
    pub fn new(required: usize, name: &'static str) -> Self {
        assert!(required > 0, "a 0-ary barrier must not be constructed");
        ReadyTable {
            name,
            required,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_ready(&self, key: u64) {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        log::trace!("{}: key {} ready count {}/{}", self.name, key, count, self.required);
    }

    pub fn is_ready(&self, key: u64) -> bool {
        let mut counts = self.counts.lock().unwrap();
        match counts.get(&key) {
            Some(&count) if count >= self.required => {
                counts.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Vec<u64> {
        self.counts.lock().unwrap().keys().copied().collect()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_exactly_once_per_n_contributions() {
        let table = ReadyTable::new(3, "TEST");
        for round in 0..4 {
            assert!(!table.is_ready(7), "round {}", round);
            table.add_ready(7);
            assert!(!table.is_ready(7));
            table.add_ready(7);
            assert!(!table.is_ready(7));
            table.add_ready(7);
            assert!(table.is_ready(7));
            // entry cleared on the ready read
            assert!(!table.is_ready(7));
        }
    }

    #[test]
    fn keys_count_independently() {
        let table = ReadyTable::new(2, "TEST");
        table.add_ready(1);
        table.add_ready(2);
        assert!(!table.is_ready(1));
        assert!(!table.is_ready(2));
        table.add_ready(1);
        assert!(table.is_ready(1));
        assert!(!table.is_ready(2));
        assert_eq!(table.pending(), vec![2]);
    }
}
