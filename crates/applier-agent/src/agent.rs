//! Page agent
//!
//! One [`PageAgent`] lives per loaded document. It answers controller
//! requests, owns the job queue run for its page and resumes persisted work
//! after a load. Navigation destroys the agent together with every task it
//! spawned; the page-scoped store is what carries the queue across.

use applier_browser::{AutomationDriver, Page};
use applier_core::config::AgentConfig;
use applier_core::{
    AgentReport, DispatchAck, JobDescriptor, JobOutcome, KeyValueStore, PageRequest, PageResponse,
    Result, TabId,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{
    transition, JobAction, JobEvent, JobQueue, JobState, NavigationAttempts, QueueSource,
};

/// Tasks belonging to one agent, aborted together when its document goes away
#[derive(Debug, Clone, Default)]
pub struct AgentTasks {
    handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl AgentTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future).abort_handle();
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Abort every task spawned so far
    pub fn abort_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            debug!("Aborted {} agent tasks", handles.len());
        }
    }
}

/// How one pass over the queue ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Head job reached a terminal state
    Finished(JobState),
    /// Navigation started; this agent is about to be destroyed
    Navigating,
    /// Nothing pending
    Drained,
}

/// The agent loaded into one page of the target site
pub struct PageAgent {
    tab: TabId,
    page: Arc<dyn Page>,
    driver: AutomationDriver,
    store: Arc<dyn KeyValueStore>,
    reporter: mpsc::UnboundedSender<AgentReport>,
    config: AgentConfig,
    tasks: AgentTasks,
    running: AtomicBool,
    queue_lock: tokio::sync::Mutex<()>,
}

impl PageAgent {
    pub fn new(
        tab: TabId,
        driver: AutomationDriver,
        store: Arc<dyn KeyValueStore>,
        reporter: mpsc::UnboundedSender<AgentReport>,
        config: AgentConfig,
        tasks: AgentTasks,
    ) -> Arc<Self> {
        Arc::new(Self {
            tab,
            page: Arc::clone(driver.page()),
            driver,
            store,
            reporter,
            config,
            tasks,
            running: AtomicBool::new(false),
            queue_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn tab(&self) -> &TabId {
        &self.tab
    }

    pub fn tasks(&self) -> &AgentTasks {
        &self.tasks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resume persisted work after this document loaded
    pub async fn on_load(self: Arc<Self>) {
        let url = match self.page.current_url().await {
            Ok(url) => url,
            Err(e) => {
                warn!("Agent on {} could not read its location: {}", self.tab, e);
                return;
            }
        };
        if !self.driver.profile().is_site_url(&url) {
            return;
        }

        let pending = match JobQueue::load(self.store.as_ref()).await {
            Ok(queue) => queue,
            Err(e) => {
                warn!("Could not read pending jobs on {}: {}", self.tab, e);
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(
            "Found {} pending jobs on {} ({:?}), resuming after {:?}",
            pending.len(),
            self.tab,
            pending.source(),
            self.config.settle_delay()
        );
        tokio::time::sleep(self.config.settle_delay()).await;
        self.run().await;
    }

    /// Answer one controller request
    pub async fn handle(self: &Arc<Self>, request: PageRequest) -> PageResponse {
        debug!("Agent on {} handling '{}'", self.tab, request.action());
        match request {
            PageRequest::Ping => PageResponse::Pong,
            PageRequest::ProcessJob { job_data: Some(job) } => {
                self.accept(vec![job], QueueSource::Single).await
            }
            PageRequest::ProcessJob { job_data: None } => PageResponse::error("No job data provided"),
            PageRequest::ProcessJobQueue { job_queue } => {
                self.accept(job_queue, QueueSource::Queue).await
            }
            PageRequest::CheckLoginStatus => match self.driver.detect_login().await {
                Ok(state) => PageResponse::LoginStatus { state },
                Err(e) => PageResponse::error(e.to_string()),
            },
            PageRequest::GetPageInfo => match self.driver.page_info().await {
                Ok(info) => PageResponse::PageInfo {
                    url: info.url,
                    title: info.title,
                    is_target_site: info.is_target_site,
                },
                Err(e) => PageResponse::error(e.to_string()),
            },
        }
    }

    /// Persist new work, then start processing in the background
    async fn accept(self: &Arc<Self>, jobs: Vec<JobDescriptor>, source: QueueSource) -> PageResponse {
        if jobs.is_empty() {
            return PageResponse::accepted(DispatchAck::Empty, "No jobs to process");
        }

        let head_url = {
            let _guard = self.queue_lock.lock().await;
            let mut queue = match JobQueue::load(self.store.as_ref()).await {
                Ok(queue) if !queue.is_empty() => queue,
                Ok(_) => JobQueue::new(source),
                Err(e) => return PageResponse::error(e.to_string()),
            };
            let added = queue.enqueue(jobs);
            if let Err(e) = queue.persist(self.store.as_ref()).await {
                error!("Failed to persist job queue on {}: {}", self.tab, e);
                return PageResponse::error(e.to_string());
            }
            info!(
                "Accepted {} jobs on {}, {} pending: {:?}",
                added,
                self.tab,
                queue.len(),
                queue.job_ids()
            );
            queue.head().map(|job| job.job_url.clone())
        };

        if self.is_running() {
            return PageResponse::accepted(DispatchAck::Processing, "Queued behind running jobs");
        }

        let agent = Arc::clone(self);
        self.tasks.spawn(async move { agent.run().await });

        let at_head = match (&head_url, self.page.current_url().await) {
            (Some(target), Ok(location)) => applier_core::same_location(target, &location),
            _ => false,
        };
        if at_head {
            PageResponse::accepted(DispatchAck::Processing, "Processing on current page")
        } else {
            PageResponse::accepted(DispatchAck::Navigating, "Navigating to job page")
        }
    }

    /// Work through the persisted queue until it drains or a navigation starts
    pub async fn run(self: Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue already running on {}", self.tab);
            return;
        }

        loop {
            match self.step().await {
                Ok(Step::Finished(state)) => {
                    debug!("Job finished on {}: {:?}", self.tab, state);
                    if self.has_pending().await {
                        tokio::time::sleep(self.config.inter_job_delay()).await;
                    }
                }
                Ok(Step::Navigating) => break,
                Ok(Step::Drained) => {
                    info!("Job queue on {} drained", self.tab);
                    break;
                }
                Err(e) => {
                    error!("Queue run on {} stopped: {}", self.tab, e);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn has_pending(&self) -> bool {
        matches!(JobQueue::load(self.store.as_ref()).await, Ok(queue) if !queue.is_empty())
    }

    /// Drive the head job through the state machine
    async fn step(&self) -> Result<Step> {
        let job = {
            let _guard = self.queue_lock.lock().await;
            match JobQueue::load(self.store.as_ref()).await?.head() {
                Some(job) => job.clone(),
                None => return Ok(Step::Drained),
            }
        };

        let (state, actions) = transition(
            JobState::Idle,
            JobEvent::Selected {
                job_id: job.job_id.clone(),
            },
        );
        let (state, mut pending) = self.apply(&job, state, actions).await?;

        if pending.is_none() {
            pending = Some(self.locate(&job).await);
        }

        let mut state = state;
        while let Some(event) = pending.take() {
            let (next, actions) = transition(state, event);
            (state, pending) = self.apply(&job, next, actions).await?;
        }

        match state {
            JobState::Navigating { url, .. } => {
                info!("Navigating {} to {} for job {}", self.tab, url, job.job_id);
                Ok(Step::Navigating)
            }
            state => Ok(Step::Finished(state)),
        }
    }

    /// Compare the current location with the job page
    async fn locate(&self, job: &JobDescriptor) -> JobEvent {
        let location = match self.page.current_url().await {
            Ok(location) => location,
            Err(e) => {
                return JobEvent::Error {
                    message: e.to_string(),
                }
            }
        };
        let attempts = match NavigationAttempts::load(self.store.as_ref(), &job.job_id).await {
            Ok(attempts) => attempts,
            Err(e) => {
                return JobEvent::Error {
                    message: e.to_string(),
                }
            }
        };

        let at_target = job.is_at(&location);
        if !at_target && attempts > 0 {
            warn!(
                "Job {} expected {} but the page is at {} after {} navigations",
                job.job_id, job.job_url, location, attempts
            );
        }
        JobEvent::LocationChecked {
            at_target,
            job_url: job.job_url.clone(),
            navigations_left: self.config.max_navigations.saturating_sub(attempts),
        }
    }

    /// Execute `actions` in order, stopping at the first one that produces
    /// the job's next event. Failures before a terminal state become that event.
    async fn apply(
        &self,
        job: &JobDescriptor,
        state: JobState,
        actions: Vec<JobAction>,
    ) -> Result<(JobState, Option<JobEvent>)> {
        for action in actions {
            match self.execute(job, action).await {
                Ok(Some(event)) => return Ok((state, Some(event))),
                Ok(None) => {}
                Err(e) if !state.is_terminal() => {
                    return Ok((
                        state,
                        Some(JobEvent::Error {
                            message: e.to_string(),
                        }),
                    ))
                }
                Err(e) => return Err(e),
            }
        }
        Ok((state, None))
    }

    /// Execute one action; processing yields the event that ends the job
    async fn execute(&self, job: &JobDescriptor, action: JobAction) -> Result<Option<JobEvent>> {
        match action {
            JobAction::PersistQueue => {
                let _guard = self.queue_lock.lock().await;
                let mut queue = JobQueue::load(self.store.as_ref()).await?;
                if !queue.contains(&job.job_id) {
                    warn!("Job {} was missing from the queue, restored", job.job_id);
                    queue.enqueue([job.clone()]);
                }
                queue.persist(self.store.as_ref()).await?;
                Ok(None)
            }
            JobAction::RecordNavigation { job_id } => {
                let attempts = NavigationAttempts::record(self.store.as_ref(), &job_id).await?;
                debug!("Navigation {} for job {}", attempts, job_id);
                Ok(None)
            }
            JobAction::Navigate { url } => {
                self.page.navigate(&url).await?;
                Ok(None)
            }
            JobAction::Process => Ok(Some(match self.process(job).await {
                Ok((success, message)) => JobEvent::Finished { success, message },
                Err(e) => {
                    warn!("Job {} failed: {}", job.job_id, e);
                    JobEvent::Error {
                        message: e.to_string(),
                    }
                }
            })),
            JobAction::Dequeue { job_id } => {
                let _guard = self.queue_lock.lock().await;
                let mut queue = JobQueue::load(self.store.as_ref()).await?;
                queue.remove(&job_id);
                queue.persist(self.store.as_ref()).await?;
                NavigationAttempts::finish(self.store.as_ref(), &job_id).await?;
                Ok(None)
            }
            JobAction::Report(outcome) => {
                self.report(outcome);
                Ok(None)
            }
        }
    }

    /// Fill and submit the proposal form for `job` on the current page
    async fn process(&self, job: &JobDescriptor) -> Result<(bool, String)> {
        info!("Processing job {} on {}", job.job_id, self.tab);

        self.driver.wait_until_ready().await?;
        tokio::time::sleep(self.config.dynamic_content_delay()).await;

        if let Some(text) = job.cover_letter() {
            self.driver.fill_cover_letter(text).await?;
        }

        let screening = self
            .driver
            .fill_screening_answers(&job.screening_answers)
            .await?;
        if !screening.unmatched.is_empty() {
            debug!(
                "Job {}: {} screening answers filled, unmatched {:?}",
                job.job_id, screening.filled, screening.unmatched
            );
        }

        self.driver.submit().await?;
        let confirmed = self
            .driver
            .verify_success(self.config.success_timeout())
            .await;
        tokio::time::sleep(job.timing.post_submit_delay()).await;

        let success = confirmed || !self.config.require_confirmation;
        let message = if confirmed {
            "Proposal submitted".to_string()
        } else {
            "Proposal submitted, no confirmation observed".to_string()
        };
        Ok((success, message))
    }

    fn report(&self, outcome: JobOutcome) {
        info!("Reporting {:?} for job {}", outcome, outcome.job_id());
        let report = AgentReport {
            tab: self.tab.clone(),
            outcome,
        };
        if let Err(e) = self.reporter.send(report) {
            error!("Controller is gone, result for job {} lost", e.0.outcome.job_id());
        }
    }
}
