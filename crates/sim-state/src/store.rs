//! The live cluster store
//!
//! One `ClusterStore` exists per session. Simulators receive it by mutable
//! reference for the duration of a single command, so every tool reads and
//! writes the same state and no tool keeps a private copy.

use chrono::{DateTime, Duration, Utc};
use sim_core::{ClusterState, JobState};
use tracing::{debug, info};

use crate::events::{EventQueue, StateEvent, JOB_START_DELAY_MS};
use crate::faults::{self, FaultInjectionConfig};

/// Simulated uptime of every node when a session starts
pub const SESSION_UPTIME_SECS: i64 = 3 * 3600 + 17 * 60 + 42;

/// Single owner of the live [`ClusterState`] and the simulated clock
#[derive(Debug, Clone)]
pub struct ClusterStore {
    state: ClusterState,
    events: EventQueue,
}

impl ClusterStore {
    pub fn new(state: ClusterState) -> Self {
        let origin = state.boot_time + Duration::seconds(SESSION_UPTIME_SECS);
        Self {
            events: EventQueue::new(origin),
            state,
        }
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ClusterState {
        &mut self.state
    }

    /// Current simulated wall-clock time
    pub fn now(&self) -> DateTime<Utc> {
        self.events.now()
    }

    /// Seconds since the nodes booted, as shown in kernel log offsets
    pub fn uptime_secs(&self) -> f64 {
        (self.now() - self.state.boot_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn schedule_after(&mut self, delay_ms: u64, event: StateEvent) {
        self.events.schedule_after(delay_ms, event);
    }

    /// Advance simulated time by `elapsed_ms` of host time
    pub fn advance(&mut self, elapsed_ms: u64) -> usize {
        let applied = self.events.advance(&mut self.state, elapsed_ms);
        if applied > 0 {
            debug!("Applied {} deferred events", applied);
        }
        applied
    }

    /// Apply fault descriptors; returns the number that took effect
    pub fn apply_faults(&mut self, configs: &[FaultInjectionConfig]) -> usize {
        let now = self.now();
        faults::apply_faults(&mut self.state, configs, now)
    }

    pub fn clear_all_faults(&mut self) {
        faults::clear_all_faults(&mut self.state);
    }

    /// Swap in a whole new state. Events queued for the old state are
    /// dropped and the queue is rebuilt from the jobs of the new one.
    pub fn replace_state(&mut self, state: ClusterState) {
        if !self.events.is_empty() {
            debug!("Dropping {} pending events on state replace", self.events.len());
        }
        self.events.clear();
        self.state = state;
        self.reschedule_jobs();
    }

    /// Queue a start for every pending job and a completion for every
    /// running job with a time limit
    fn reschedule_jobs(&mut self) {
        let now = self.now();
        let mut scheduled = 0;
        for job in &self.state.jobs {
            match job.state {
                JobState::Pending => {
                    self.events
                        .schedule_after(JOB_START_DELAY_MS, StateEvent::JobStart { job_id: job.id });
                    scheduled += 1;
                }
                JobState::Running => {
                    let (Some(start), Some(minutes)) = (job.start_time, job.time_limit_minutes) else {
                        continue;
                    };
                    let end = start + Duration::minutes(i64::from(minutes));
                    let remaining = (end - now).num_milliseconds().max(0) as u64;
                    self.events
                        .schedule_after(remaining, StateEvent::JobComplete { job_id: job.id });
                    scheduled += 1;
                }
                _ => {}
            }
        }
        if scheduled > 0 {
            info!("Rescheduled {} job events after state replace", scheduled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultKind;
    use sim_core::fixtures::demo_cluster;
    use sim_core::{ClusterConfig, HealthStatus, Job};

    fn store() -> ClusterStore {
        ClusterStore::new(demo_cluster(&ClusterConfig {
            nodes: 1,
            gpus_per_node: 2,
            ..ClusterConfig::default()
        }))
    }

    #[test]
    fn test_clock_starts_after_boot() {
        let mut store = store();
        assert_eq!(store.uptime_secs(), SESSION_UPTIME_SECS as f64);
        store.advance(1_500);
        assert_eq!(store.uptime_secs(), SESSION_UPTIME_SECS as f64 + 1.5);
    }

    #[test]
    fn test_faults_go_through_the_store() {
        let mut store = store();
        let fault = FaultInjectionConfig::new("dgx-00", Some(0), FaultKind::XidError { xid: 79 });
        assert_eq!(store.apply_faults(&[fault]), 1);
        assert_eq!(store.state().nodes[0].health, HealthStatus::Critical);

        store.clear_all_faults();
        assert_eq!(store.state().nodes[0].health, HealthStatus::Ok);
    }

    #[test]
    fn test_replace_state_drops_stale_events() {
        let mut store = store();
        store.schedule_after(1_000, StateEvent::JobStart { job_id: 1000 });
        let fresh = store.state().clone();
        store.replace_state(fresh);
        assert!(store.events().is_empty());
    }

    fn job(limit: Option<u32>) -> Job {
        Job {
            id: 0,
            name: "train".into(),
            user: "root".into(),
            partition: "batch".into(),
            requested_node: None,
            node: None,
            gpus_requested: 1,
            gpu_ids: Vec::new(),
            state: JobState::Pending,
            reason: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            time_limit_minutes: limit,
        }
    }

    #[test]
    fn test_replace_state_requeues_jobs() {
        let mut store = store();
        let pending = store.state_mut().submit_job(job(None));
        let timed = store.state_mut().submit_job(job(Some(10)));
        let now = store.now();
        assert!(store.state_mut().start_job(timed, now).unwrap());
        let saved = store.state().clone();

        // Four of the ten minutes pass before the restore
        store.advance(4 * 60_000);
        store.replace_state(saved);
        assert_eq!(store.events().len(), 2);

        store.advance(JOB_START_DELAY_MS);
        assert_eq!(store.state().job(pending).unwrap().state, JobState::Running);
        assert_eq!(store.state().job(timed).unwrap().state, JobState::Running);

        store.advance(5 * 60_000);
        assert_eq!(store.state().job(timed).unwrap().state, JobState::Running);
        store.advance(60_000);
        assert_eq!(store.state().job(timed).unwrap().state, JobState::Completed);
    }
}
