//! Deferred state mutations
//!
//! Simulated time only moves when the host calls [`EventQueue::advance`], so
//! tests can step the clock deterministically. Due events are applied in
//! `(due time, scheduling order)` order, each as one complete mutation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sim_core::{ClusterState, JobState};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

/// Delay between job submission and the first start attempt
pub const JOB_START_DELAY_MS: u64 = 2_000;

/// Delay between a pending job failing to start and the next attempt
pub const JOB_RETRY_DELAY_MS: u64 = 30_000;

/// A state mutation scheduled for later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEvent {
    /// Move a pending job to running and allocate its GPUs
    JobStart { job_id: u32 },
    /// Finish a running job and release its GPUs
    JobComplete { job_id: u32 },
}

#[derive(Debug, Clone)]
struct ScheduledEvent {
    due_ms: u64,
    seq: u64,
    event: StateEvent,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Simulated clock plus the events waiting on it
#[derive(Debug, Clone)]
pub struct EventQueue {
    origin: DateTime<Utc>,
    now_ms: u64,
    next_seq: u64,
    events: BinaryHeap<ScheduledEvent>,
}

impl EventQueue {
    /// Create a queue whose clock starts at `origin`
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            now_ms: 0,
            next_seq: 0,
            events: BinaryHeap::new(),
        }
    }

    /// Current simulated time
    pub fn now(&self) -> DateTime<Utc> {
        self.origin + Duration::milliseconds(self.now_ms as i64)
    }

    /// Simulated milliseconds since the queue was created
    pub fn elapsed_ms(&self) -> u64 {
        self.now_ms
    }

    /// Schedule an event `delay_ms` after the current simulated time
    pub fn schedule_after(&mut self, delay_ms: u64, event: StateEvent) {
        let due_ms = self.now_ms + delay_ms;
        debug!("Scheduling {:?} at +{}ms", event, due_ms);
        self.events.push(ScheduledEvent {
            due_ms,
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time of the next event (if any), in simulated milliseconds
    pub fn next_event_time(&self) -> Option<u64> {
        self.events.peek().map(|e| e.due_ms)
    }

    /// Drop every pending event, e.g. after the whole state was replaced
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Move the clock forward by `elapsed_ms` of host time and apply every
    /// event that falls due. Returns the number of events applied.
    pub fn advance(&mut self, state: &mut ClusterState, elapsed_ms: u64) -> usize {
        let scaled = (elapsed_ms as f64 * state.simulation_speed.max(0.0)).round() as u64;
        let target = self.now_ms.saturating_add(scaled);
        let mut applied = 0;

        while let Some(next) = self.events.peek() {
            if next.due_ms > target {
                break;
            }
            let Some(scheduled) = self.events.pop() else {
                break;
            };
            self.now_ms = scheduled.due_ms;
            self.apply(state, scheduled.event);
            applied += 1;
        }

        self.now_ms = target;
        applied
    }

    fn apply(&mut self, state: &mut ClusterState, event: StateEvent) {
        let now = self.now();
        match event {
            StateEvent::JobStart { job_id } => match state.start_job(job_id, now) {
                Ok(true) => {
                    debug!("Job {} started", job_id);
                    let limit = state.job(job_id).and_then(|j| j.time_limit_minutes);
                    if let Some(minutes) = limit {
                        self.schedule_after(
                            u64::from(minutes) * 60_000,
                            StateEvent::JobComplete { job_id },
                        );
                    }
                }
                Ok(false) => {
                    let still_pending = state
                        .job(job_id)
                        .map_or(false, |j| j.state == JobState::Pending);
                    if still_pending {
                        debug!("Job {} waiting for resources", job_id);
                        self.schedule_after(JOB_RETRY_DELAY_MS, StateEvent::JobStart { job_id });
                    }
                }
                Err(e) => debug!("Dropping start of job {}: {}", job_id, e),
            },
            StateEvent::JobComplete { job_id } => {
                let running = state
                    .job(job_id)
                    .map_or(false, |j| j.state == JobState::Running);
                if running {
                    if let Err(e) = state.finish_job(job_id, JobState::Completed, now) {
                        debug!("Dropping completion of job {}: {}", job_id, e);
                    } else {
                        debug!("Job {} completed", job_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_core::fixtures::demo_cluster;
    use sim_core::{ClusterConfig, Job, NodeId};

    fn cluster() -> ClusterState {
        demo_cluster(&ClusterConfig {
            nodes: 1,
            gpus_per_node: 4,
            ..ClusterConfig::default()
        })
    }

    fn job(gpus: u32, limit: Option<u32>) -> Job {
        Job {
            id: 0,
            name: "train".into(),
            user: "root".into(),
            partition: "batch".into(),
            requested_node: Some(NodeId::new("dgx-00")),
            node: None,
            gpus_requested: gpus,
            gpu_ids: vec![],
            state: JobState::Pending,
            reason: None,
            submit_time: chrono::Utc::now(),
            start_time: None,
            end_time: None,
            time_limit_minutes: limit,
        }
    }

    #[test]
    fn test_events_fire_in_time_order() {
        let mut state = cluster();
        let mut queue = EventQueue::new(state.boot_time);
        let a = state.submit_job(job(1, None));
        let b = state.submit_job(job(1, None));

        queue.schedule_after(5_000, StateEvent::JobStart { job_id: b });
        queue.schedule_after(1_000, StateEvent::JobStart { job_id: a });
        assert_eq!(queue.next_event_time(), Some(1_000));

        assert_eq!(queue.advance(&mut state, 2_000), 1);
        assert_eq!(state.job(a).unwrap().state, JobState::Running);
        assert_eq!(state.job(b).unwrap().state, JobState::Pending);

        assert_eq!(queue.advance(&mut state, 3_000), 1);
        assert_eq!(state.job(b).unwrap().state, JobState::Running);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_time_limit_schedules_completion() {
        let mut state = cluster();
        let mut queue = EventQueue::new(state.boot_time);
        let id = state.submit_job(job(2, Some(1)));
        queue.schedule_after(2_000, StateEvent::JobStart { job_id: id });

        queue.advance(&mut state, 2_000);
        assert_eq!(state.job(id).unwrap().state, JobState::Running);
        assert_eq!(queue.len(), 1);

        queue.advance(&mut state, 60_000);
        assert_eq!(state.job(id).unwrap().state, JobState::Completed);
        assert!(state.node("dgx-00").unwrap().gpus.iter().all(|g| g.allocated_job.is_none()));
    }

    #[test]
    fn test_simulation_speed_scales_elapsed_time() {
        let mut state = cluster();
        state.simulation_speed = 10.0;
        let mut queue = EventQueue::new(state.boot_time);
        let id = state.submit_job(job(1, None));
        queue.schedule_after(2_000, StateEvent::JobStart { job_id: id });

        queue.advance(&mut state, 200);
        assert_eq!(state.job(id).unwrap().state, JobState::Running);
        assert_eq!(queue.elapsed_ms(), 2_000);
    }

    #[test]
    fn test_unplaceable_job_is_retried() {
        let mut state = cluster();
        let mut queue = EventQueue::new(state.boot_time);
        let id = state.submit_job(job(16, None));
        queue.schedule_after(0, StateEvent::JobStart { job_id: id });

        queue.advance(&mut state, 0);
        let job = state.job(id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.reason.as_deref(), Some("Resources"));
        assert_eq!(queue.next_event_time(), Some(JOB_RETRY_DELAY_MS));
    }

    #[test]
    fn test_cancelled_job_is_not_started() {
        let mut state = cluster();
        let mut queue = EventQueue::new(state.boot_time);
        let id = state.submit_job(job(1, None));
        queue.schedule_after(1_000, StateEvent::JobStart { job_id: id });
        state.finish_job(id, JobState::Cancelled, state.boot_time).unwrap();

        queue.advance(&mut state, 5_000);
        assert_eq!(state.job(id).unwrap().state, JobState::Cancelled);
        assert!(queue.is_empty());
    }
}
