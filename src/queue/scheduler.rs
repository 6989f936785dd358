//! Weighted round-robin lane scheduling: lanes are visited in proportion to
//! their configured weight, FIFO within a lane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::task::{Lane, Task};

pub struct LaneScheduler {
    weights: Vec<(Lane, u32)>,
    cursor: AtomicUsize,
}

impl LaneScheduler {
    pub fn new(mut weights: Vec<(Lane, u32)>) -> Self {
        weights.retain(|(_, w)| *w > 0);
        if weights.is_empty() {
            weights = vec![(Lane::Default, 1)];
        }
        Self {
            weights,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn group_by_lane(&self, tasks: Vec<Task>) -> HashMap<Lane, Vec<Task>> {
        let mut by_lane: HashMap<Lane, Vec<Task>> = HashMap::new();
        for task in tasks {
            by_lane.entry(task.lane).or_default().push(task);
        }
        for bucket in by_lane.values_mut() {
            bucket.sort_by_key(|t| t.created_at_ms);
        }
        by_lane
    }

    /// Pick the next task to claim by walking a weighted schedule starting
    /// at the scheduler's cursor, skipping empty lanes, and advancing the
    /// cursor so the next call continues from where this one left off.
    pub fn next(&self, by_lane: &HashMap<Lane, Vec<Task>>) -> Option<Task> {
        if by_lane.values().all(|v| v.is_empty()) {
            return None;
        }

        let schedule = self.expanded_schedule();
        let len = schedule.len();
        for step in 0..len {
            let idx = (self.cursor.fetch_add(1, Ordering::SeqCst) + step) % len;
            let lane = schedule[idx];
            if let Some(bucket) = by_lane.get(&lane) {
                if let Some(task) = bucket.first() {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    /// Expand weights into a flat round-robin order, e.g. weights
    /// Critical:2, Default:1 becomes [Critical, Default, Critical].
    fn expanded_schedule(&self) -> Vec<Lane> {
        let mut schedule = Vec::new();
        let max_weight = self.weights.iter().map(|(_, w)| *w).max().unwrap_or(1);
        for round in 0..max_weight {
            for (lane, weight) in &self.weights {
                if round < *weight {
                    schedule.push(*lane);
                }
            }
        }
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn task(lane: Lane) -> Task {
        Task::new("t", lane, Value::Null)
    }

    #[test]
    fn higher_weight_lane_is_picked_more_often() {
        let scheduler = LaneScheduler::new(vec![(Lane::Critical, 3), (Lane::Low, 1)]);
        let mut by_lane = HashMap::new();
        by_lane.insert(Lane::Critical, vec![task(Lane::Critical); 10]);
        by_lane.insert(Lane::Low, vec![task(Lane::Low); 10]);

        let mut critical_count = 0;
        let mut low_count = 0;
        for _ in 0..8 {
            match scheduler.next(&by_lane) {
                Some(t) if t.lane == Lane::Critical => critical_count += 1,
                Some(t) if t.lane == Lane::Low => low_count += 1,
                _ => {}
            }
        }
        assert!(critical_count > low_count);
    }

    #[test]
    fn empty_lanes_return_none() {
        let scheduler = LaneScheduler::new(vec![(Lane::Default, 1)]);
        let by_lane = HashMap::new();
        assert!(scheduler.next(&by_lane).is_none());
    }

    #[test]
    fn skips_empty_lane_and_falls_through_to_populated_one() {
        let scheduler = LaneScheduler::new(vec![(Lane::Critical, 5), (Lane::Low, 1)]);
        let mut by_lane = HashMap::new();
        by_lane.insert(Lane::Critical, vec![]);
        by_lane.insert(Lane::Low, vec![task(Lane::Low)]);
        let picked = scheduler.next(&by_lane).unwrap();
        assert_eq!(picked.lane, Lane::Low);
    }
}
