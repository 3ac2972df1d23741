//! The controller context
//!
//! Long-lived owner of the session transport. It turns inbound job messages
//! into page dispatches, forwards terminal results from page agents to the job
//! source, keeps the operator's login state reported, and answers control
//! commands. All dependencies are injected so tests can swap the socket, the
//! tab host, the store and the session API.

use applier_browser::SiteProfile;
use applier_core::fail_open::fail_open;
use applier_core::store::{load_json, save_json};
use applier_core::{
    keys, AgentReport, ApplierConfig, ApplierError, ClientMessage, ControlCommand,
    ControlResponse, JobOutcome, KeyValueStore, PageRequest, Result, ServerMessage, StatusReport,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap::SessionApi;
use crate::dispatcher::{failure_reason, Dispatcher};
use crate::login::LoginMonitor;
use crate::outbox::ResultOutbox;
use crate::transport::{SessionTransport, TransportEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mutable controller state
#[derive(Debug)]
struct SessionState {
    session_id: Option<String>,
    last_status: Option<String>,
    login_required: bool,
    connected_since: Option<DateTime<Utc>>,
    outbox: ResultOutbox,
}

pub struct Controller {
    config: ApplierConfig,
    transport: SessionTransport,
    store: Arc<dyn KeyValueStore>,
    dispatcher: Arc<Dispatcher>,
    login: LoginMonitor,
    api: Arc<dyn SessionApi>,
    state: Mutex<SessionState>,
    login_poll: Mutex<Option<AbortHandle>>,
    /// Job dispatches run one at a time so concurrent messages never open
    /// two tabs for the same site
    dispatch_lock: tokio::sync::Mutex<()>,
}

impl Controller {
    pub fn new(
        config: ApplierConfig,
        transport: SessionTransport,
        dispatcher: Dispatcher,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn SessionApi>,
    ) -> Result<Arc<Self>> {
        let profile = Arc::new(SiteProfile::from_config(&config.site)?);
        let dispatcher = Arc::new(dispatcher);
        let outbox = ResultOutbox::new(config.transport.outbox_capacity);

        Ok(Arc::new(Self {
            login: LoginMonitor::new(Arc::clone(&dispatcher), profile),
            config,
            transport,
            store,
            dispatcher,
            api,
            state: Mutex::new(SessionState {
                session_id: None,
                last_status: None,
                login_required: false,
                connected_since: None,
                outbox,
            }),
            login_poll: Mutex::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.state).session_id.clone()
    }

    /// Process transport events and agent reports until both channels close
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut reports: mpsc::UnboundedReceiver<AgentReport>,
    ) {
        info!("Controller running");
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_transport_event(event),
                Some(report) = reports.recv() => {
                    debug!("Tab {} finished {}", report.tab, report.outcome.job_id());
                    self.report(report.outcome);
                }
                else => break,
            }
        }
        info!("Controller stopped");
    }

    /// Reconnect the stored session, if the operator was logged in.
    ///
    /// Returns whether a connection was started.
    pub async fn resume_from_store(&self) -> Result<bool> {
        let session_id = self.load_record::<String>(keys::SESSION_ID).await?;
        let logged_in = self.load_record::<bool>(keys::IS_LOGGED_IN).await?;

        match (session_id, logged_in) {
            (Some(session_id), Some(true)) => {
                info!("Resuming stored session {}", session_id);
                self.start_transport(&session_id);
                Ok(true)
            }
            _ => {
                debug!("No resumable session in store");
                Ok(false)
            }
        }
    }

    async fn load_record<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match load_json(self.store.as_ref(), key).await {
            Err(ApplierError::PersistenceCorruption { .. }) => Ok(None),
            other => other,
        }
    }

    /// Answer one control-surface command
    pub async fn handle_control(&self, command: ControlCommand) -> ControlResponse {
        debug!("Control command: {:?}", command);
        let result = match command {
            ControlCommand::ConnectToSession { session_id } => {
                self.connect_to_session(session_id).await
            }
            ControlCommand::StartSession => self.start_session().await,
            ControlCommand::GetStatus => Ok(ControlResponse::Status(self.status())),
            ControlCommand::ConfirmLogin { session_id } => self.confirm_login(session_id).await,
            ControlCommand::Disconnect => self.disconnect().await,
        };
        result.unwrap_or_else(|e| {
            warn!("Control command failed: {}", e);
            ControlResponse::from(e)
        })
    }

    async fn connect_to_session(&self, session_id: String) -> Result<ControlResponse> {
        info!("Connecting to session {}", session_id);
        let is_logged_in = self.login.check().await.is_logged_in();

        save_json(self.store.as_ref(), keys::SESSION_ID, &session_id).await?;
        save_json(self.store.as_ref(), keys::IS_LOGGED_IN, &is_logged_in).await?;
        self.start_transport(&session_id);

        Ok(ControlResponse::Session {
            session_id,
            is_logged_in,
            message: "Connected to session".to_string(),
        })
    }

    async fn start_session(&self) -> Result<ControlResponse> {
        let session_id = self.api.create_session().await?;

        save_json(self.store.as_ref(), keys::SESSION_ID, &session_id).await?;
        save_json(self.store.as_ref(), keys::IS_LOGGED_IN, &true).await?;
        self.start_transport(&session_id);

        Ok(ControlResponse::Session {
            session_id,
            is_logged_in: true,
            message: "Session started".to_string(),
        })
    }

    async fn confirm_login(&self, session_id: Option<String>) -> Result<ControlResponse> {
        let session_id = session_id.or_else(|| self.session_id());
        self.transport.send(&ClientMessage::LoginStatus {
            is_logged_in: true,
            session_id,
        })?;

        lock(&self.state).login_required = false;
        fail_open("store_login_state", || {
            save_json(self.store.as_ref(), keys::IS_LOGGED_IN, &true)
        })
        .await;
        Ok(ControlResponse::ok("Login confirmed"))
    }

    async fn disconnect(&self) -> Result<ControlResponse> {
        self.transport.disconnect();
        self.stop_login_poll();
        // Page-scoped work first, so no tab resumes a job of the old session
        self.dispatcher.tabs().clear_page_state().await?;
        self.store.clear().await?;

        let mut state = lock(&self.state);
        if !state.outbox.is_empty() {
            warn!(
                "Discarding {} unsent job results on disconnect",
                state.outbox.len()
            );
        }
        state.outbox.clear();
        state.session_id = None;
        state.last_status = None;
        state.login_required = false;
        state.connected_since = None;
        info!("Disconnected");
        Ok(ControlResponse::ok("Disconnected"))
    }

    pub fn status(&self) -> StatusReport {
        let connection_state = self.transport.state();
        let state = lock(&self.state);
        StatusReport {
            connected: connection_state.is_connected(),
            session_id: state.session_id.clone(),
            connection_state,
            badge: connection_state.badge().to_string(),
            last_status: state.last_status.clone(),
            login_required: state.login_required,
            pending_results: state.outbox.len(),
            connected_since: state.connected_since,
        }
    }

    fn start_transport(&self, session_id: &str) {
        lock(&self.state).session_id = Some(session_id.to_string());
        self.transport.connect(session_id);
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Closed => {
                info!("Connection to job source lost, reconnect scheduled");
                lock(&self.state).connected_since = None;
            }
            TransportEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_opened(self: &Arc<Self>) {
        let session_id = {
            let mut state = lock(&self.state);
            state.connected_since = Some(Utc::now());
            state.session_id.clone()
        };
        let Some(session_id) = session_id else {
            warn!("Connection opened without a session");
            return;
        };

        if let Err(e) = self
            .transport
            .send(&ClientMessage::ExtensionConnected { session_id })
        {
            debug!("extension_connected not sent: {}", e);
        }
        self.flush_outbox();

        let this = Arc::clone(self);
        tokio::spawn(async move { this.report_login_status().await });
        self.start_login_poll();
    }

    fn on_message(self: &Arc<Self>, message: ServerMessage) {
        info!("Job source sent {}", message.kind());
        match message {
            ServerMessage::JobApplication { job_data: Some(job) } => {
                self.spawn_dispatch(PageRequest::ProcessJob {
                    job_data: Some(job),
                })
            }
            ServerMessage::JobApplication { job_data: None } => {
                error!("job_application without jobData, ignoring")
            }
            ServerMessage::JobQueue { jobs } if jobs.is_empty() => debug!("Empty job queue"),
            ServerMessage::JobQueue { jobs } => {
                self.spawn_dispatch(PageRequest::ProcessJobQueue { job_queue: jobs })
            }
            ServerMessage::LoginRequired => {
                warn!("Job source asks the operator to log in to {}", self.config.site.host);
                lock(&self.state).login_required = true;
            }
            ServerMessage::StatusUpdate { status } => {
                info!("Status update: {}", status);
                lock(&self.state).last_status = Some(status);
            }
            ServerMessage::Unknown => {}
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, request: PageRequest) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(request).await });
    }

    async fn dispatch(&self, request: PageRequest) {
        let _serial = self.dispatch_lock.lock().await;
        let job_ids = request.job_ids();

        match self.dispatcher.dispatch_jobs(request).await {
            Ok(ack) => debug!("Dispatched {:?}: {:?}", job_ids, ack),
            // The page reports these jobs itself once it resumes them
            Err(e @ ApplierError::DeliveryUnconfirmed(_)) => {
                warn!("Dispatch of {:?} unconfirmed, leaving them to the page: {}", job_ids, e)
            }
            Err(e) => {
                warn!("Dispatch of {:?} failed: {}", job_ids, e);
                let reason = failure_reason(&e);
                for job_id in job_ids {
                    self.report(JobOutcome::failed(job_id, reason.clone()));
                }
            }
        }
    }

    /// Send a terminal job result, keeping it in the outbox while disconnected
    fn report(&self, outcome: JobOutcome) {
        let message = ClientMessage::from(outcome);
        let mut state = lock(&self.state);
        state.outbox.push(message);
        let sent = state.outbox.flush(|message| self.transport.send(message));
        if !state.outbox.is_empty() {
            info!(
                "{} job results waiting for the connection ({} sent now)",
                state.outbox.len(),
                sent
            );
        }
    }

    fn flush_outbox(&self) {
        let mut state = lock(&self.state);
        if state.outbox.is_empty() {
            return;
        }
        let sent = state.outbox.flush(|message| self.transport.send(message));
        info!("Flushed {} pending job results", sent);
    }

    /// Probe login state, report it upstream and mirror it into the store
    pub async fn report_login_status(&self) {
        let is_logged_in = self.login.check().await.is_logged_in();
        let report = ClientMessage::LoginStatus {
            is_logged_in,
            session_id: self.session_id(),
        };
        if let Err(e) = self.transport.send(&report) {
            debug!("login_status not sent: {}", e);
        }
        fail_open("store_login_state", || {
            save_json(self.store.as_ref(), keys::IS_LOGGED_IN, &is_logged_in)
        })
        .await;
    }

    /// Start the recurring login poll unless it is already running
    fn start_login_poll(self: &Arc<Self>) {
        let mut poll = lock(&self.login_poll);
        if poll.is_some() {
            return;
        }

        let interval = self.config.transport.login_poll_interval();
        let controller: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.report_login_status().await;
            }
        });
        debug!("Login poll started every {:?}", interval);
        *poll = Some(task.abort_handle());
    }

    fn stop_login_poll(&self) {
        if let Some(task) = lock(&self.login_poll).take() {
            task.abort();
            debug!("Login poll stopped");
        }
    }

    pub fn is_polling_login(&self) -> bool {
        lock(&self.login_poll).is_some()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_login_poll();
    }
}
