//! Fire-time schedule of one online application
//!
//! Times are epoch milliseconds. The schedule holds the fire times of the
//! current one-minute window followed by the time the next window is built.

use rand::Rng;
use std::collections::VecDeque;
use tracing::warn;

use crate::constants::CREATE_SCHEDULE_INTERVAL_MILLS;

/// What the application should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing due yet
    Sleep,
    /// Run one execution
    Execute,
    /// A new window was built
    Rebuilt,
}

#[derive(Debug)]
pub struct Schedule {
    list: VecDeque<i64>,
    exec_per_min: i32,
}

impl Schedule {
    /// Schedule whose first window is built at `start_time`
    pub fn new(exec_per_min: i32, start_time: i64) -> Self {
        Self {
            list: VecDeque::from([start_time]),
            exec_per_min,
        }
    }

    /// Decide what to do at `now`
    ///
    /// A negative rate never sleeps: the application executes back-to-back and
    /// the schedule only marks the window boundaries.
    pub fn poll(&mut self, now: i64, rng: &mut impl Rng) -> Tick {
        let Some(&head) = self.list.front() else {
            self.rebuild(now, now, rng);
            return Tick::Rebuilt;
        };
        if now < head {
            return if self.exec_per_min > 0 {
                Tick::Sleep
            } else {
                Tick::Execute
            };
        }
        self.list.pop_front();
        if self.list.is_empty() {
            // the last entry of a window is the time to build the next one
            self.rebuild(head, now, rng);
            Tick::Rebuilt
        } else {
            Tick::Execute
        }
    }

    fn rebuild(&mut self, base: i64, now: i64, rng: &mut impl Rng) {
        let mut base = base;
        if base + CREATE_SCHEDULE_INTERVAL_MILLS < now {
            warn!(
                "Detected a large delay in the schedule and reset the base time (base = {}, now = {})",
                base, now
            );
            base = now;
        }
        let mut times: Vec<i64> = (0..self.exec_per_min.max(0))
            .map(|_| base + rng.gen_range(0..CREATE_SCHEDULE_INTERVAL_MILLS))
            .collect();
        times.sort_unstable();
        self.list.extend(times);
        self.list.push_back(base + CREATE_SCHEDULE_INTERVAL_MILLS);
    }

    /// Pending times, the last one being the next rebuild
    pub fn pending(&self) -> impl Iterator<Item = i64> + '_ {
        self.list.iter().copied()
    }

    pub fn next_time(&self) -> Option<i64> {
        self.list.front().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const BASE: i64 = 1_600_000_000_000;

    #[test]
    fn test_first_poll_builds_window() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut schedule = Schedule::new(60, BASE);

        assert_eq!(schedule.poll(BASE, &mut rng), Tick::Rebuilt);

        let times: Vec<i64> = schedule.pending().collect();
        assert_eq!(times.len(), 61);
        assert_eq!(*times.last().unwrap(), BASE + CREATE_SCHEDULE_INTERVAL_MILLS);
        let fire_times = &times[..60];
        assert!(fire_times.windows(2).all(|w| w[0] <= w[1]));
        assert!(fire_times
            .iter()
            .all(|t| (BASE..BASE + CREATE_SCHEDULE_INTERVAL_MILLS).contains(t)));
    }

    #[test]
    fn test_sleep_until_due_then_execute() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut schedule = Schedule::new(1, BASE);
        schedule.poll(BASE, &mut rng);
        let due = schedule.next_time().unwrap();

        if due > BASE {
            assert_eq!(schedule.poll(due - 1, &mut rng), Tick::Sleep);
        }
        assert_eq!(schedule.poll(due, &mut rng), Tick::Execute);
        assert_eq!(schedule.next_time(), Some(BASE + CREATE_SCHEDULE_INTERVAL_MILLS));
        assert_eq!(schedule.poll(BASE + CREATE_SCHEDULE_INTERVAL_MILLS, &mut rng), Tick::Rebuilt);
    }

    #[test]
    fn test_negative_rate_runs_back_to_back() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut schedule = Schedule::new(-1, BASE);
        assert_eq!(schedule.poll(BASE, &mut rng), Tick::Rebuilt);
        assert_eq!(schedule.pending().count(), 1);
        assert_eq!(schedule.poll(BASE + 1, &mut rng), Tick::Execute);
        assert_eq!(schedule.poll(BASE + 2, &mut rng), Tick::Execute);
    }

    #[test]
    fn test_large_delay_resets_base() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut schedule = Schedule::new(10, BASE);
        let late = BASE + 5 * CREATE_SCHEDULE_INTERVAL_MILLS;

        assert_eq!(schedule.poll(late, &mut rng), Tick::Rebuilt);
        assert!(schedule.pending().all(|t| t >= late));
        assert_eq!(schedule.pending().last(), Some(late + CREATE_SCHEDULE_INTERVAL_MILLS));
    }
}
