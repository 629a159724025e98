//! Random key selection shared by the online generators
//!
//! The selector manages a random subset of the keys. `get` either picks one
//! uniformly or, with probability `alo_select_rate`, draws from an
//! at-least-once list that hands out every key once before any key repeats.

use parking_lot::Mutex;
use phonebill_core::{AppError, AppResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
struct KeyPosition {
    key: usize,
    /// None once the key was drawn from the at-least-once list
    alo: Option<usize>,
}

#[derive(Debug)]
struct Inner<K> {
    key_list: Vec<K>,
    alo_list: Vec<K>,
    positions: HashMap<K, KeyPosition>,
    rng: StdRng,
    alo_select_rate: f64,
}

/// Thread-safe random key selector
#[derive(Debug)]
pub struct RandomKeySelector<K> {
    inner: Mutex<Inner<K>>,
}

impl<K: Clone + Eq + Hash> RandomKeySelector<K> {
    /// Manage `ceil(keys.len() * coverage_rate)` of `keys`, chosen at random
    pub fn new(
        keys: Vec<K>,
        mut rng: StdRng,
        alo_select_rate: f64,
        coverage_rate: f64,
    ) -> AppResult<Self> {
        if !(0.0..=1.0).contains(&alo_select_rate) {
            return Err(AppError::InvalidInput(format!(
                "at least once select rate must be in [0, 1]: {}",
                alo_select_rate
            )));
        }
        if !(0.0..=1.0).contains(&coverage_rate) {
            return Err(AppError::InvalidInput(format!(
                "coverage rate must be in [0, 1]: {}",
                coverage_rate
            )));
        }
        let mut key_list = keys;
        let size = (key_list.len() as f64 * coverage_rate).ceil() as usize;
        if size < key_list.len() {
            key_list.shuffle(&mut rng);
            key_list.truncate(size);
        }

        let mut positions = HashMap::with_capacity(key_list.len());
        for (i, key) in key_list.iter().enumerate() {
            let position = KeyPosition { key: i, alo: Some(i) };
            if positions.insert(key.clone(), position).is_some() {
                return Err(AppError::InvalidInput("duplicate key in key list".to_string()));
            }
        }
        let alo_list = key_list.clone();
        let mut inner = Inner {
            key_list,
            alo_list,
            positions,
            rng,
            alo_select_rate,
        };
        inner.shuffle_alo_list();
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Random key, None when no key is managed
    pub fn get(&self) -> Option<K> {
        self.inner.lock().get()
    }

    /// Random key, removed from the selector
    pub fn get_and_remove(&self) -> Option<K> {
        let mut inner = self.inner.lock();
        let key = inner.get()?;
        inner.remove(&key);
        Some(key)
    }

    /// Returns false when the key is not managed
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().remove(key)
    }

    /// Returns false when the key is already managed
    pub fn add(&self, key: K) -> bool {
        self.inner.lock().add(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().positions.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().key_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn get(&mut self) -> Option<K> {
        if self.key_list.is_empty() {
            return None;
        }
        if self.alo_select_rate > 0.0 && self.rng.gen_bool(self.alo_select_rate) {
            if self.alo_list.is_empty() {
                self.alo_list = self.key_list.clone();
                self.shuffle_alo_list();
            }
            let key = self.alo_list.pop()?;
            if let Some(position) = self.positions.get_mut(&key) {
                position.alo = None;
            }
            return Some(key);
        }
        let i = self.rng.gen_range(0..self.key_list.len());
        Some(self.key_list[i].clone())
    }

    /// Shuffle the at-least-once list and reindex every key in it
    fn shuffle_alo_list(&mut self) {
        self.alo_list.shuffle(&mut self.rng);
        for position in self.positions.values_mut() {
            position.alo = None;
        }
        for (i, key) in self.alo_list.iter().enumerate() {
            if let Some(position) = self.positions.get_mut(key) {
                position.alo = Some(i);
            }
        }
    }

    fn remove(&mut self, key: &K) -> bool {
        let Some(position) = self.positions.remove(key) else {
            return false;
        };
        self.key_list.swap_remove(position.key);
        if let Some(moved) = self.key_list.get(position.key) {
            if let Some(p) = self.positions.get_mut(moved) {
                p.key = position.key;
            }
        }
        if let Some(alo) = position.alo {
            self.alo_list.swap_remove(alo);
            if let Some(moved) = self.alo_list.get(alo) {
                if let Some(p) = self.positions.get_mut(moved) {
                    p.alo = Some(alo);
                }
            }
        }
        true
    }

    fn add(&mut self, key: K) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        let position = KeyPosition {
            key: self.key_list.len(),
            alo: Some(self.alo_list.len()),
        };
        self.key_list.push(key.clone());
        self.alo_list.push(key.clone());
        self.positions.insert(key, position);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn selector(n: u32, alo_rate: f64, coverage: f64) -> RandomKeySelector<u32> {
        RandomKeySelector::new((0..n).collect(), StdRng::seed_from_u64(42), alo_rate, coverage)
            .unwrap()
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let result = RandomKeySelector::new(vec![1, 2, 1], StdRng::seed_from_u64(0), 0.0, 1.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_rates_out_of_range_rejected() {
        assert!(RandomKeySelector::new(vec![1], StdRng::seed_from_u64(0), 1.5, 1.0).is_err());
        assert!(RandomKeySelector::new(vec![1], StdRng::seed_from_u64(0), 0.5, -0.1).is_err());
    }

    #[test]
    fn test_coverage_rate_rounds_up() {
        assert_eq!(selector(10, 0.0, 0.25).size(), 3);
        assert_eq!(selector(10, 0.0, 1.0).size(), 10);
        assert_eq!(selector(10, 0.0, 0.0).size(), 0);
    }

    #[test]
    fn test_empty_selector_returns_none() {
        let selector = selector(0, 0.5, 1.0);
        assert_eq!(selector.get(), None);
        assert_eq!(selector.get_and_remove(), None);
    }

    #[test]
    fn test_at_least_once_hands_out_every_key() {
        let selector = selector(100, 1.0, 1.0);
        let mut seen = HashSet::new();
        while let Some(key) = selector.get_and_remove() {
            assert!(seen.insert(key));
        }
        assert_eq!(seen.len(), 100);
        assert!(selector.is_empty());
    }

    #[test]
    fn test_at_least_once_list_refills() {
        let selector = selector(5, 1.0, 1.0);
        let first: HashSet<u32> = (0..5).filter_map(|_| selector.get()).collect();
        let second: HashSet<u32> = (0..5).filter_map(|_| selector.get()).collect();
        assert_eq!(first.len(), 5);
        assert_eq!(second, first);
    }

    #[test]
    fn test_remove_then_add() {
        let selector = selector(10, 0.5, 1.0);
        assert!(selector.remove(&3));
        assert!(!selector.remove(&3));
        assert!(!selector.contains(&3));
        assert_eq!(selector.size(), 9);
        assert!(selector.add(3));
        assert!(!selector.add(3));
        assert_eq!(selector.size(), 10);
        for _ in 0..1000 {
            assert!(selector.get().is_some_and(|k| k < 10));
        }
    }

    proptest! {
        #[test]
        fn prop_positions_stay_consistent(
            n in 1u32..50,
            ops in prop::collection::vec((any::<bool>(), 0u32..60), 0..200),
        ) {
            let selector = selector(n, 0.5, 1.0);
            let mut live: HashSet<u32> = (0..n).collect();
            for (add, key) in ops {
                if add {
                    prop_assert_eq!(selector.add(key), live.insert(key));
                } else {
                    prop_assert_eq!(selector.remove(&key), live.remove(&key));
                }
                if let Some(key) = selector.get() {
                    prop_assert!(live.contains(&key));
                }
            }
            prop_assert_eq!(selector.size(), live.len());
            for key in &live {
                prop_assert!(selector.contains(key));
            }
            let inner = selector.inner.lock();
            for (key, position) in &inner.positions {
                prop_assert_eq!(&inner.key_list[position.key], key);
                if let Some(alo) = position.alo {
                    prop_assert_eq!(&inner.alo_list[alo], key);
                }
            }
            prop_assert_eq!(inner.positions.len(), inner.key_list.len());
        }
    }
}
