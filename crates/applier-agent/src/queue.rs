//! Job queue state machine
//!
//! The per-job lifecycle is a pure function with NO I/O:
//! `transition(state, event) -> (state, actions)`. The page agent executes
//! the returned actions in order. Every action that precedes a
//! context-destroying navigation persists first, so the next page load can
//! pick up exactly where this one stopped.
//!
//! - Invalid transitions go to `Failed` (never panic)
//! - A job reaches exactly one terminal state per processing run
//!
//! [`JobQueue`] is the persisted form of pending work in the page-scoped store.
//! [`NavigationAttempts`] counts navigations started for the head job, so a
//! job page that keeps redirecting elsewhere fails instead of looping.

use applier_core::store::{load_json, save_json};
use applier_core::{keys, ApplierError, JobDescriptor, JobOutcome, KeyValueStore, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Lifecycle of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// No job selected
    Idle,
    /// Persisted, waiting for its location check
    Queued { job_id: String },
    /// Navigation to the job page started; resumes on the next load
    Navigating { job_id: String, url: String },
    /// Filling and submitting on the job page
    Processing { job_id: String },
    /// Submitted
    Completed { job_id: String, success: bool },
    /// Gave up on this job
    Failed { job_id: String, error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Queued { job_id }
            | Self::Navigating { job_id, .. }
            | Self::Processing { job_id }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => Some(job_id),
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job became head of the persisted queue
    Selected { job_id: String },
    /// Current location compared with the job's target
    LocationChecked {
        at_target: bool,
        job_url: String,
        /// Navigations still allowed for this job
        navigations_left: u32,
    },
    /// Processing ended; `success` reflects the confirmation policy
    Finished { success: bool, message: String },
    /// Anything went wrong for this job
    Error { message: String },
}

/// Side effects, executed in order by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Write the pending queue to the page-scoped store
    PersistQueue,
    /// Count one more navigation for the job
    RecordNavigation { job_id: String },
    /// Start navigating (destroys the current context)
    Navigate { url: String },
    /// Start the processing step on the current page
    Process,
    /// Remove the job from the persisted queue
    Dequeue { job_id: String },
    /// Send the terminal outcome to the controller
    Report(JobOutcome),
}

fn finish(job_id: String, outcome: JobOutcome, state: JobState) -> (JobState, Vec<JobAction>) {
    (
        state,
        vec![JobAction::Dequeue { job_id }, JobAction::Report(outcome)],
    )
}

/// Pure state transition function
///
/// # Invalid Transitions
/// Any invalid transition results in a Failed state with no actions.
/// This function never panics.
pub fn transition(state: JobState, event: JobEvent) -> (JobState, Vec<JobAction>) {
    match (state, event) {
        (JobState::Idle, JobEvent::Selected { job_id }) => {
            (JobState::Queued { job_id }, vec![JobAction::PersistQueue])
        }

        (JobState::Queued { job_id }, JobEvent::LocationChecked { at_target: true, .. }) => {
            (JobState::Processing { job_id }, vec![JobAction::Process])
        }

        (
            JobState::Queued { job_id },
            JobEvent::LocationChecked {
                at_target: false,
                job_url,
                navigations_left: 0,
            },
        ) => {
            let error = format!("Navigation did not reach job page {}", job_url);
            let outcome = JobOutcome::failed(job_id.clone(), error.clone());
            let state = JobState::Failed {
                job_id: job_id.clone(),
                error,
            };
            finish(job_id, outcome, state)
        }

        // Persist before the navigation tears this context down
        (JobState::Queued { job_id }, JobEvent::LocationChecked { at_target: false, job_url, .. }) => (
            JobState::Navigating {
                job_id: job_id.clone(),
                url: job_url.clone(),
            },
            vec![
                JobAction::PersistQueue,
                JobAction::RecordNavigation { job_id },
                JobAction::Navigate { url: job_url },
            ],
        ),

        (JobState::Processing { job_id }, JobEvent::Finished { success, message }) => {
            let outcome = JobOutcome::completed(job_id.clone(), success, message);
            let state = JobState::Completed {
                job_id: job_id.clone(),
                success,
            };
            finish(job_id, outcome, state)
        }

        (JobState::Queued { job_id }, JobEvent::Error { message })
        | (JobState::Navigating { job_id, .. }, JobEvent::Error { message })
        | (JobState::Processing { job_id }, JobEvent::Error { message }) => {
            let outcome = JobOutcome::failed(job_id.clone(), message.clone());
            let state = JobState::Failed {
                job_id: job_id.clone(),
                error: message,
            };
            finish(job_id, outcome, state)
        }

        (JobState::Idle, JobEvent::Error { message }) => (
            JobState::Failed {
                job_id: String::new(),
                error: message,
            },
            vec![],
        ),

        (state, event) => (
            JobState::Failed {
                job_id: state.job_id().unwrap_or_default().to_string(),
                error: format!(
                    "Invalid job transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}

/// Where the pending work was (and will be) stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSource {
    /// `jobQueue`: an ordered list
    Queue,
    /// `jobData`: one job from a `process_job` request
    Single,
}

/// Pending jobs of one tab, in processing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueue {
    source: QueueSource,
    jobs: VecDeque<JobDescriptor>,
}

impl JobQueue {
    pub fn new(source: QueueSource) -> Self {
        Self {
            source,
            jobs: VecDeque::new(),
        }
    }

    /// Read pending work: the `jobQueue` list followed by a pending `jobData`.
    ///
    /// Corrupt records are discarded and treated as absent.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let listed: Vec<JobDescriptor> = discard_corrupt(load_json(store, keys::JOB_QUEUE).await)?
            .unwrap_or_default();
        let single: Option<JobDescriptor> = discard_corrupt(load_json(store, keys::JOB_DATA).await)?;

        let source = if listed.is_empty() && single.is_some() {
            QueueSource::Single
        } else {
            QueueSource::Queue
        };
        let mut queue = Self::new(source);
        queue.enqueue(listed);
        queue.enqueue(single);
        queue.source = source;
        Ok(queue)
    }

    /// Write the pending set back, removing records that became empty
    pub async fn persist(&self, store: &dyn KeyValueStore) -> Result<()> {
        match (self.source, self.jobs.front()) {
            (QueueSource::Single, Some(job)) if self.jobs.len() == 1 => {
                save_json(store, keys::JOB_DATA, job).await?;
                store.remove(keys::JOB_QUEUE).await
            }
            _ if self.jobs.is_empty() => {
                store.remove(keys::JOB_QUEUE).await?;
                store.remove(keys::JOB_DATA).await?;
                NavigationAttempts::clear(store).await
            }
            _ => {
                save_json(store, keys::JOB_QUEUE, &self.jobs).await?;
                store.remove(keys::JOB_DATA).await
            }
        }
    }

    /// Append jobs not already pending; returns how many were added
    pub fn enqueue(&mut self, jobs: impl IntoIterator<Item = JobDescriptor>) -> usize {
        let mut added = 0;
        for job in jobs {
            if self.contains(&job.job_id) {
                warn!("Job {} is already pending, ignoring duplicate", job.job_id);
                continue;
            }
            self.jobs.push_back(job);
            added += 1;
        }
        if self.jobs.len() > 1 {
            self.source = QueueSource::Queue;
        }
        added
    }

    /// Drop the first pending job with `job_id`
    pub fn remove(&mut self, job_id: &str) -> Option<JobDescriptor> {
        let index = self.jobs.iter().position(|job| job.job_id == job_id)?;
        self.jobs.remove(index)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.iter().any(|job| job.job_id == job_id)
    }

    pub fn head(&self) -> Option<&JobDescriptor> {
        self.jobs.front()
    }

    pub fn source(&self) -> QueueSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.job_id.as_str()).collect()
    }
}

/// Navigations started for one job, persisted across the loads they cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationAttempts {
    pub job_id: String,
    pub attempts: u32,
}

impl NavigationAttempts {
    /// Navigations already started for `job_id`; a record for another job counts as none
    pub async fn load(store: &dyn KeyValueStore, job_id: &str) -> Result<u32> {
        let record: Option<Self> =
            discard_corrupt(load_json(store, keys::NAVIGATION_ATTEMPTS).await)?;
        Ok(record
            .filter(|record| record.job_id == job_id)
            .map_or(0, |record| record.attempts))
    }

    /// Count one more navigation for `job_id`, returning the new total
    pub async fn record(store: &dyn KeyValueStore, job_id: &str) -> Result<u32> {
        let attempts = Self::load(store, job_id).await? + 1;
        let record = Self {
            job_id: job_id.to_string(),
            attempts,
        };
        save_json(store, keys::NAVIGATION_ATTEMPTS, &record).await?;
        Ok(attempts)
    }

    /// Forget the count once `job_id` left the queue
    pub async fn finish(store: &dyn KeyValueStore, job_id: &str) -> Result<()> {
        let record: Option<Self> =
            discard_corrupt(load_json(store, keys::NAVIGATION_ATTEMPTS).await)?;
        match record {
            Some(record) if record.job_id == job_id => Self::clear(store).await,
            _ => Ok(()),
        }
    }

    pub async fn clear(store: &dyn KeyValueStore) -> Result<()> {
        store.remove(keys::NAVIGATION_ATTEMPTS).await
    }
}

fn discard_corrupt<T>(loaded: Result<Option<T>>) -> Result<Option<T>> {
    match loaded {
        Err(ApplierError::PersistenceCorruption { key, reason }) => {
            warn!("Pending work in '{}' was corrupt and has been dropped: {}", key, reason);
            Ok(None)
        }
        other => other,
    }
}
