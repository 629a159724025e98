//! Work queue feeding the calculation workers
//!
//! A bounded blocking deque. The orchestrator puts one [`WorkItem`] per
//! contract and then one end-of-work sentinel per worker. Sentinels are never
//! held back by the capacity bound, so every worker can always be released.

use chrono::NaiveDate;
use parking_lot::{Condvar, Mutex};
use phonebill_core::models::Contract;
use std::collections::VecDeque;
use std::fmt;

use super::calculator::{BillingCalculator, CallChargeCalculator};

/// One contract to bill for one period
pub struct CalculationTarget {
    pub contract: Contract,
    pub billing_calculator: Box<dyn BillingCalculator>,
    pub call_charge_calculator: Box<dyn CallChargeCalculator>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Debug for CalculationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculationTarget")
            .field("contract", &self.contract)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Unit of work taken by a worker
#[derive(Debug)]
pub enum WorkItem {
    Calculate(Box<CalculationTarget>),
    EndOfWork,
}

impl WorkItem {
    pub fn is_end_of_work(&self) -> bool {
        matches!(self, WorkItem::EndOfWork)
    }
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<WorkItem>,
    total_put: u64,
}

/// Bounded blocking work queue
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue sized for `thread_count` workers
    pub fn for_workers(thread_count: usize) -> Self {
        Self::new(thread_count.max(1) * crate::constants::QUEUE_DEPTH_PER_WORKER)
    }

    /// Append an item, waiting while the queue is full
    pub fn put(&self, item: WorkItem) {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if !item.is_end_of_work() {
            state.total_put += 1;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Insert an item at the head, ahead of everything queued
    pub fn put_first(&self, item: WorkItem) {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if !item.is_end_of_work() {
            state.total_put += 1;
        }
        state.items.push_front(item);
        self.not_empty.notify_one();
    }

    /// Remove the head item, waiting until one is available
    pub fn take(&self) -> WorkItem {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Remove the head item without waiting
    pub fn poll(&self) -> Option<WorkItem> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Append `n` end-of-work sentinels regardless of capacity
    pub fn set_end_of_work(&self, n: usize) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.items.push_back(WorkItem::EndOfWork);
        }
        self.not_empty.notify_all();
    }

    /// Drop every queued work item
    ///
    /// Sentinels stay queued so that workers already waiting in
    /// [`take`](Self::take) still get released.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.retain(WorkItem::is_end_of_work);
        self.not_full.notify_all();
    }

    /// Replace everything queued with exactly `n` sentinels
    ///
    /// Used when the producer stops early: the `n` workers still waiting for
    /// work each get one sentinel and nothing else.
    pub fn abort(&self, n: usize) {
        let mut state = self.state.lock();
        state.items.clear();
        for _ in 0..n {
            state.items.push_back(WorkItem::EndOfWork);
        }
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn status(&self) -> String {
        let state = self.state.lock();
        format!(
            "Contracts queue status: total queued tasks = {}, tasks in queue = {}",
            state.total_put,
            state.items.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::calculator::{SimpleBillingCalculator, SimpleCallChargeCalculator};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn item(phone: &str) -> WorkItem {
        let start = NaiveDate::from_ymd_opt(2020, 12, 1).unwrap();
        WorkItem::Calculate(Box::new(CalculationTarget {
            contract: Contract::new(phone, start, None, "rule"),
            billing_calculator: Box::new(SimpleBillingCalculator::default()),
            call_charge_calculator: Box::new(SimpleCallChargeCalculator),
            start,
            end: NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        }))
    }

    fn phone(item: &WorkItem) -> Option<&str> {
        match item {
            WorkItem::Calculate(target) => Some(&target.contract.phone_number),
            WorkItem::EndOfWork => None,
        }
    }

    #[test]
    fn test_fifo_with_put_first() {
        let queue = WorkQueue::new(10);
        queue.put(item("1"));
        queue.put(item("2"));
        queue.put_first(item("0"));
        queue.set_end_of_work(1);

        assert_eq!(phone(&queue.take()), Some("0"));
        assert_eq!(phone(&queue.take()), Some("1"));
        assert_eq!(phone(&queue.take()), Some("2"));
        assert!(queue.take().is_end_of_work());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_status() {
        let queue = WorkQueue::new(10);
        queue.put(item("1"));
        queue.put(item("2"));
        queue.take();
        queue.set_end_of_work(2);
        assert_eq!(
            queue.status(),
            "Contracts queue status: total queued tasks = 2, tasks in queue = 3"
        );
    }

    #[test]
    fn test_poll_does_not_block() {
        let queue = WorkQueue::new(10);
        assert!(queue.poll().is_none());
        queue.put(item("1"));
        queue.set_end_of_work(1);
        assert_eq!(phone(&queue.poll().unwrap()), Some("1"));
        assert!(queue.poll().unwrap().is_end_of_work());
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_abort_leaves_one_sentinel_per_worker() {
        let queue = WorkQueue::new(10);
        queue.put(item("1"));
        queue.put(item("2"));
        queue.set_end_of_work(1);
        queue.abort(3);
        assert_eq!(queue.size(), 3);
        for _ in 0..3 {
            assert!(queue.take().is_end_of_work());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_abort_releases_blocked_producer() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.put(item("1"));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(item("2")))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abort(0);
        producer.join().unwrap();
        assert_eq!(phone(&queue.poll().unwrap()), Some("2"));
    }

    #[test]
    fn test_sentinels_ignore_capacity() {
        let queue = WorkQueue::new(1);
        queue.put(item("1"));
        queue.set_end_of_work(3);
        assert_eq!(queue.size(), 4);
    }

    #[test]
    fn test_put_blocks_until_take() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.put(item("1"));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(item("2")))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.size(), 1);

        assert_eq!(phone(&queue.take()), Some("1"));
        producer.join().unwrap();
        assert_eq!(phone(&queue.take()), Some("2"));
    }

    #[test]
    fn test_clear_keeps_sentinels() {
        let queue = WorkQueue::new(10);
        queue.put(item("1"));
        queue.set_end_of_work(2);
        queue.put_first(item("0"));
        queue.clear();
        assert_eq!(queue.size(), 2);
        assert!(queue.take().is_end_of_work());
        assert!(queue.take().is_end_of_work());
    }

    #[test]
    fn test_clear_releases_blocked_producer() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.put(item("1"));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(item("2")))
        };
        thread::sleep(Duration::from_millis(20));
        queue.clear();
        producer.join().unwrap();
        assert_eq!(queue.size(), 1);
    }
}
