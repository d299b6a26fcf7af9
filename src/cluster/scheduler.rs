//! Heartbeat-driven job scheduling.
//!
//! Every node heartbeat reports the jobs the node knows about. The scheduler
//! reconciles that report against the job map, then drains the node's queues
//! into new jobs while the node has spare resources.

use super::job::{Job, JobReport, JobState, ScheduleJobsResult, UnregisterFlags};
use super::node::NodeResources;
use super::replicator::ChunkReplicator;
use crate::error::{ReplicatorError, Result};
use crate::types::*;
use chrono::Utc;
use metrics::counter;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, warn};

/// First entry strictly after `cursor`, or the first entry when `cursor` is `None`.
fn next_entry<K: Ord + Copy, V: Copy>(queue: &BTreeMap<K, V>, cursor: Option<K>) -> Option<(K, V)> {
    let next = match cursor {
        None => queue.iter().next(),
        Some(cursor) => queue.range((Excluded(cursor), Unbounded)).next(),
    };
    next.map(|(key, value)| (*key, *value))
}

/// A single data-size overshoot is allowed so that one large chunk cannot
/// starve a node.
fn has_spare_replication_resources(usage: &NodeResources, limits: &NodeResources) -> bool {
    usage.replication_slots < limits.replication_slots
        && (usage.replication_slots == 0 || usage.replication_data_size < limits.replication_data_size)
}

fn has_spare_repair_resources(usage: &NodeResources, limits: &NodeResources) -> bool {
    usage.repair_slots < limits.repair_slots
        && (usage.repair_slots == 0 || usage.repair_data_size < limits.repair_data_size)
}

impl ChunkReplicator {
    /// Handle one node heartbeat: settle the reported jobs and hand out new
    /// ones.
    pub fn schedule_jobs(&mut self, node_id: NodeId, reports: &[JobReport]) -> Result<ScheduleJobsResult> {
        if self.state.node(&node_id).is_none() {
            return Err(ReplicatorError::NodeNotFound(node_id));
        }

        let mut result = ScheduleJobsResult::default();
        self.process_existing_jobs(node_id, reports, &mut result);
        self.schedule_new_jobs(node_id, &mut result);

        debug!(
            node_id,
            started = result.jobs_to_start.len(),
            aborted = result.jobs_to_abort.len(),
            removed = result.jobs_to_remove.len(),
            "Jobs scheduled for node"
        );
        Ok(result)
    }

    fn process_existing_jobs(&mut self, node_id: NodeId, reports: &[JobReport], result: &mut ScheduleJobsResult) {
        let now = Utc::now();
        let mut reported = HashSet::with_capacity(reports.len());

        for report in reports {
            let job_id = report.job_id;
            reported.insert(job_id);

            let known = self
                .jobs
                .get(&job_id)
                .filter(|job| job.node == node_id)
                .map(|job| (job.kind, job.chunk, job.start_time));
            let Some((kind, chunk, start_time)) = known else {
                if report.state.is_finished() {
                    result.jobs_to_remove.push(job_id);
                } else {
                    warn!(job_id = %job_id, node_id, state = ?report.state, "Unknown job");
                    result.jobs_to_abort.push(job_id);
                }
                continue;
            };

            match report.state {
                JobState::Waiting | JobState::Running => {
                    let started = report.start_time.unwrap_or(start_time);
                    let age = (now - started).to_std().unwrap_or_default();
                    if age > self.config.job_timeout {
                        warn!(
                            job_id = %job_id,
                            job_kind = %kind,
                            chunk_id = %chunk,
                            node_id,
                            age_secs = age.as_secs(),
                            "Job timed out"
                        );
                        counter!("replicator_jobs_timed_out_total", "kind" => kind.as_str()).increment(1);
                        result.jobs_to_abort.push(job_id);
                    } else {
                        debug!(job_id = %job_id, job_kind = %kind, state = ?report.state, node_id, "Job in progress");
                    }
                }
                JobState::Completed => {
                    debug!(job_id = %job_id, job_kind = %kind, chunk_id = %chunk, node_id, "Job completed");
                    counter!("replicator_jobs_completed_total", "kind" => kind.as_str()).increment(1);
                    result.jobs_to_remove.push(job_id);
                    self.unregister_job(&job_id, UnregisterFlags::ALL);
                }
                JobState::Failed => {
                    warn!(
                        job_id = %job_id,
                        job_kind = %kind,
                        chunk_id = %chunk,
                        node_id,
                        error = report.error.as_deref().unwrap_or(""),
                        "Job failed"
                    );
                    counter!("replicator_jobs_failed_total", "kind" => kind.as_str()).increment(1);
                    result.jobs_to_remove.push(job_id);
                    self.unregister_job(&job_id, UnregisterFlags::ALL);
                }
                JobState::Aborted => {
                    warn!(job_id = %job_id, job_kind = %kind, chunk_id = %chunk, node_id, "Job aborted");
                    counter!("replicator_jobs_aborted_total", "kind" => kind.as_str()).increment(1);
                    result.jobs_to_remove.push(job_id);
                    self.unregister_job(&job_id, UnregisterFlags::ALL);
                }
            }
        }

        let missing: Vec<JobId> = self
            .state
            .node(&node_id)
            .map(|node| node.jobs().iter().filter(|id| !reported.contains(id)).copied().collect())
            .unwrap_or_default();
        for job_id in missing {
            warn!(job_id = %job_id, node_id, "Job is missing");
            counter!("replicator_jobs_missing_total").increment(1);
            self.unregister_job(&job_id, UnregisterFlags::ALL);
        }
    }

    fn node_resources(&self, node_id: NodeId) -> Option<(NodeResources, NodeResources)> {
        self.state
            .node(&node_id)
            .map(|node| (*node.resource_usage(), *node.resource_limits()))
    }

    fn has_spare_replication(&self, node_id: NodeId) -> bool {
        self.node_resources(node_id)
            .map_or(false, |(usage, limits)| has_spare_replication_resources(&usage, &limits))
    }

    fn has_spare_repair(&self, node_id: NodeId) -> bool {
        self.node_resources(node_id)
            .map_or(false, |(usage, limits)| has_spare_repair_resources(&usage, &limits))
    }

    fn has_spare_removal(&self, node_id: NodeId) -> bool {
        self.node_resources(node_id)
            .map_or(false, |(usage, limits)| usage.removal_slots < limits.removal_slots)
    }

    fn has_spare_seal(&self, node_id: NodeId) -> bool {
        self.node_resources(node_id)
            .map_or(false, |(usage, limits)| usage.seal_slots < limits.seal_slots)
    }

    fn start_job(&mut self, job: Job, result: &mut ScheduleJobsResult) {
        counter!("replicator_jobs_started_total", "kind" => job.kind.as_str()).increment(1);
        self.register_job(job.clone());
        result.jobs_to_start.push(job);
    }

    fn schedule_new_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        if self.throttler.is_overdraft() {
            debug!(node_id, "Job throttler is in overdraft, no new jobs");
            return;
        }

        if self.is_enabled() {
            self.schedule_replication_jobs(node_id, result);
            self.schedule_repair_jobs(node_id, result);
            self.schedule_removal_jobs(node_id, result);
            self.schedule_balancing_jobs(node_id, result);
        }
        self.schedule_seal_jobs(node_id, result);
    }

    fn schedule_replication_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        let priority_count = self
            .state
            .node(&node_id)
            .map_or(0, |node| node.replication_queues().len());

        'queues: for priority in 0..priority_count {
            let mut cursor = None;
            loop {
                if !self.has_spare_replication(node_id) {
                    break 'queues;
                }
                let Some((replica, media)) = self
                    .state
                    .node(&node_id)
                    .and_then(|node| next_entry(&node.replication_queues()[priority], cursor))
                else {
                    break;
                };
                cursor = Some(replica);

                let mut satisfied = MediumSet::EMPTY;
                for medium in media.iter() {
                    let (done, job) = self.create_replication_job(node_id, &replica, medium);
                    if done {
                        satisfied.insert(medium);
                    }
                    if let Some(job) = job {
                        self.start_job(job, result);
                    }
                }

                let queue = self
                    .state
                    .node_mut(&node_id)
                    .and_then(|node| node.replication_queue_mut(priority));
                if let Some(queue) = queue {
                    if let Some(remaining) = queue.get_mut(&replica) {
                        remaining.remove_all(satisfied);
                        if remaining.is_empty() {
                            queue.remove(&replica);
                        }
                    }
                }
            }
        }
    }

    fn schedule_repair_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        let mut cursor = None;
        while self.has_spare_repair(node_id) {
            let Some((token, entry)) = self.repair_queue.next_after(cursor) else {
                break;
            };
            cursor = Some(token);

            let (done, job) = self.create_repair_job(node_id, &entry);
            if done {
                self.repair_queue.remove(token);
                if let Some(chunk) = self.state.chunk_mut(&entry.id) {
                    chunk.set_repair_queue_token(entry.medium, None);
                }
            }
            if let Some(job) = job {
                self.start_job(job, result);
            }
        }
    }

    fn schedule_removal_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        let mut cursor = None;
        while self.has_spare_removal(node_id) {
            let Some((replica, media)) = self
                .state
                .node(&node_id)
                .and_then(|node| next_entry(node.removal_queue(), cursor))
            else {
                break;
            };
            cursor = Some(replica);

            let mut satisfied = MediumSet::EMPTY;
            for medium in media.iter() {
                let (done, job) = self.create_removal_job(node_id, &replica.with_medium(medium));
                if done {
                    satisfied.insert(medium);
                }
                if let Some(job) = job {
                    self.start_job(job, result);
                }
            }

            if let Some(node) = self.state.node_mut(&node_id) {
                let queue = node.removal_queue_mut();
                if let Some(remaining) = queue.get_mut(&replica) {
                    remaining.remove_all(satisfied);
                    if remaining.is_empty() {
                        queue.remove(&replica);
                    }
                }
            }
        }
    }

    fn schedule_balancing_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        let media: Vec<MediumIndex> = self.state.media().store_media().map(|medium| medium.index).collect();
        for medium in media {
            let Some(fill_factor) = self.state.node(&node_id).and_then(|node| node.fill_factor(medium)) else {
                continue;
            };
            let max_fill_factor = fill_factor - self.config.min_balancing_fill_factor_diff;
            if !self.has_spare_replication(node_id)
                || fill_factor <= self.config.min_balancing_fill_factor
                || !self.placement.has_balancing_targets(&self.state, medium, max_fill_factor)
            {
                continue;
            }

            let Some((usage, limits)) = self.node_resources(node_id) else {
                return;
            };
            let max_jobs = limits.replication_slots.saturating_sub(usage.replication_slots) as usize;
            let candidates = self.placement.balancing_chunks(&self.state, medium, node_id, max_jobs);
            for replica in candidates {
                if !self.has_spare_replication(node_id) {
                    break;
                }
                let (_, job) = self.create_balancing_job(node_id, &replica, max_fill_factor);
                if let Some(job) = job {
                    self.start_job(job, result);
                }
            }
        }
    }

    fn schedule_seal_jobs(&mut self, node_id: NodeId, result: &mut ScheduleJobsResult) {
        let mut cursor = None;
        while self.has_spare_seal(node_id) {
            let Some((chunk_id, media)) = self
                .state
                .node(&node_id)
                .and_then(|node| next_entry(node.seal_queue(), cursor))
            else {
                break;
            };
            cursor = Some(chunk_id);

            let mut satisfied = MediumSet::EMPTY;
            for medium in media.iter() {
                let entry = ChunkIdWithIndexes::new(chunk_id, GENERIC_REPLICA_INDEX, medium);
                let (done, job) = self.create_seal_job(node_id, &entry);
                if done {
                    satisfied.insert(medium);
                }
                if let Some(job) = job {
                    self.start_job(job, result);
                }
            }

            if let Some(node) = self.state.node_mut(&node_id) {
                let queue = node.seal_queue_mut();
                if let Some(remaining) = queue.get_mut(&chunk_id) {
                    remaining.remove_all(satisfied);
                    if remaining.is_empty() {
                        queue.remove(&chunk_id);
                    }
                }
            }
        }
    }
}
