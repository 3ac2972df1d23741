//! Controller behaviour against an in-process job source and scripted tabs

use applier_agent::InProcessTabs;
use applier_browser::scripted::{ScriptedDocument, ScriptedSite};
use applier_browser::DomNode;
use applier_controller::channel::{ChannelConnector, RemoteEnd};
use applier_controller::{Controller, Dispatcher, SessionApi, SessionTransport};
use applier_core::store::{load_json, save_json};
use applier_core::{
    keys, AgentReport, ApplierConfig, ApplierError, ClientMessage, ConnectionState,
    ControlCommand, ControlResponse, JsonFileStore, KeyValueStore, MemoryStore, PageRequest, PageResponse,
    Result, TabHost, TabId, TabInfo,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const HOME: &str = "https://site/";
const JOB_URL: &str = "https://site/x";

struct FixedApi;

#[async_trait]
impl SessionApi for FixedApi {
    async fn create_session(&self) -> Result<String> {
        Ok("s-new".to_string())
    }
}

/// Tab host with one site tab whose agent never loads
struct DeadTabs;

#[async_trait]
impl TabHost for DeadTabs {
    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        Ok(Some(TabInfo {
            id: TabId::new("tab-1"),
            url: HOME.to_string(),
            active: true,
        }))
    }

    async fn site_tabs(&self) -> Result<Vec<TabInfo>> {
        Ok(self.active_tab().await?.into_iter().collect())
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo> {
        Err(ApplierError::Browser(format!("cannot open {}", url)))
    }

    async fn clear_page_state(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, tab: &TabId, _request: PageRequest) -> Result<PageResponse> {
        Err(ApplierError::AgentUnavailable(tab.to_string()))
    }
}

/// Scripted tabs whose first job deliveries reach the agent but lose the reply,
/// as when the page navigates before answering
struct LosingTabs {
    inner: Arc<InProcessTabs>,
    lost_replies: AtomicUsize,
}

#[async_trait]
impl TabHost for LosingTabs {
    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        self.inner.active_tab().await
    }

    async fn site_tabs(&self) -> Result<Vec<TabInfo>> {
        self.inner.site_tabs().await
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo> {
        self.inner.create_tab(url).await
    }

    async fn clear_page_state(&self) -> Result<()> {
        self.inner.clear_page_state().await
    }

    async fn send(&self, tab: &TabId, request: PageRequest) -> Result<PageResponse> {
        let carries_jobs = matches!(
            request,
            PageRequest::ProcessJob { .. } | PageRequest::ProcessJobQueue { .. }
        );
        let response = self.inner.send(tab, request).await?;
        let lose = carries_jobs
            && self
                .lost_replies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lose {
            Err(ApplierError::ContextDestroyed(tab.to_string()))
        } else {
            Ok(response)
        }
    }
}

fn config() -> ApplierConfig {
    let mut config = ApplierConfig::default();
    config.site.host = "site".to_string();
    config.site.home_url = HOME.to_string();
    config
}

fn site() -> ScriptedSite {
    let site = ScriptedSite::new();
    site.route(
        HOME,
        ScriptedDocument::new("Find work")
            .with_node(DomNode::element(1, "div").with_attr("data-test", "user-menu")),
    );
    site.route(
        JOB_URL,
        ScriptedDocument::new("Job x")
            .with_node(DomNode::element(1, "textarea").with_attr("name", "coverLetter"))
            .with_node(
                DomNode::element(2, "button")
                    .with_attr("data-test", "submit-btn")
                    .with_text("Submit proposal"),
            )
            .on_click(
                2,
                DomNode::element(3, "div")
                    .with_attr("class", "alert-success")
                    .with_text("Your proposal was submitted"),
            ),
    );
    site
}

struct Harness {
    controller: Arc<Controller>,
    connector: ChannelConnector,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    store: MemoryStore,
    // Keeps the report channel open for hosts that never report
    _reporter: mpsc::UnboundedSender<AgentReport>,
}

impl Harness {
    fn new(tabs: Arc<dyn TabHost>, reports: mpsc::UnboundedReceiver<AgentReport>) -> Self {
        Self::with_reporter(tabs, reports, None)
    }

    fn with_reporter(
        tabs: Arc<dyn TabHost>,
        reports: mpsc::UnboundedReceiver<AgentReport>,
        reporter: Option<mpsc::UnboundedSender<AgentReport>>,
    ) -> Self {
        let config = config();
        let (connector, remotes) = ChannelConnector::new();
        let (transport, events) = SessionTransport::new(
            Arc::new(connector.clone()),
            config.ws_base_url(),
            &config.transport,
        );
        let dispatcher = Dispatcher::new(tabs, &config);
        let store = MemoryStore::new();
        let controller = Controller::new(
            config,
            transport,
            dispatcher,
            Arc::new(store.clone()),
            Arc::new(FixedApi),
        )
        .unwrap();
        tokio::spawn(Arc::clone(&controller).run(events, reports));

        let _reporter = reporter.unwrap_or_else(|| mpsc::unbounded_channel().0);
        Self {
            controller,
            connector,
            remotes,
            store,
            _reporter,
        }
    }

    /// Harness over scripted tabs; no tab is open yet
    fn scripted(site: &ScriptedSite) -> Self {
        let (reporter, reports) = mpsc::unbounded_channel();
        let tabs = InProcessTabs::new(Arc::new(site.clone()), &config(), reporter).unwrap();
        Self::new(Arc::new(tabs), reports)
    }

    /// Harness over scripted tabs the test keeps a handle on
    fn hosted(site: &ScriptedSite) -> (Self, Arc<InProcessTabs>) {
        let (reporter, reports) = mpsc::unbounded_channel();
        let tabs = Arc::new(InProcessTabs::new(Arc::new(site.clone()), &config(), reporter).unwrap());
        (Self::new(Arc::clone(&tabs) as Arc<dyn TabHost>, reports), tabs)
    }

    /// Harness over scripted tabs losing the reply to the first `lost` job deliveries
    fn losing(site: &ScriptedSite, lost: usize) -> Self {
        let (reporter, reports) = mpsc::unbounded_channel();
        let inner = Arc::new(InProcessTabs::new(Arc::new(site.clone()), &config(), reporter).unwrap());
        let tabs = LosingTabs {
            inner,
            lost_replies: AtomicUsize::new(lost),
        };
        Self::new(Arc::new(tabs), reports)
    }

    fn dead() -> Self {
        let (reporter, reports) = mpsc::unbounded_channel();
        Self::with_reporter(Arc::new(DeadTabs), reports, Some(reporter))
    }

    async fn accept(&mut self) -> RemoteEnd {
        tokio::time::timeout(Duration::from_secs(60), self.remotes.recv())
            .await
            .expect("no connection within a minute")
            .expect("connector dropped")
    }
}

async fn next_message(remote: &mut RemoteEnd) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(60), remote.recv())
        .await
        .expect("no message within a minute")
        .expect("client hung up")
}

async fn next_terminal(remote: &mut RemoteEnd) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match remote.recv().await {
                Some(message) if message.is_terminal() => return message,
                Some(_) => continue,
                None => panic!("client hung up"),
            }
        }
    })
    .await
    .expect("no job result within ten minutes")
}

#[tokio::test(start_paused = true)]
async fn test_job_application_end_to_end() {
    let site = site();
    let mut harness = Harness::scripted(&site);

    let response = harness
        .controller
        .handle_control(ControlCommand::ConnectToSession {
            session_id: "s-1".into(),
        })
        .await;
    assert_eq!(
        response,
        ControlResponse::Session {
            session_id: "s-1".into(),
            is_logged_in: false,
            message: "Connected to session".into(),
        }
    );

    let mut remote = harness.accept().await;
    assert_eq!(remote.url(), "ws://127.0.0.1:8000/ws/s-1");
    assert_eq!(
        next_message(&mut remote).await,
        ClientMessage::ExtensionConnected {
            session_id: "s-1".into()
        }
    );
    assert_eq!(
        next_message(&mut remote).await,
        ClientMessage::LoginStatus {
            is_logged_in: false,
            session_id: Some("s-1".into())
        }
    );

    remote.send_json(&json!({
        "type": "job_application",
        "jobData": {
            "jobId": "j1",
            "jobUrl": JOB_URL,
            "coverLetterText": "Hello",
            "timing": {"postSubmitDelayMs": 3000}
        }
    }));

    assert_eq!(
        next_terminal(&mut remote).await,
        ClientMessage::JobCompleted {
            job_id: "j1".into(),
            success: true,
            message: "Proposal submitted".into(),
        }
    );

    let pages = site.pages();
    assert_eq!(pages.len(), 1);
    let page = &pages[0];
    assert_eq!(page.navigations(), vec![JOB_URL.to_string()]);
    assert_eq!(page.value_of(1).as_deref(), Some("Hello"));
    assert_eq!(page.clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_agent_fails_every_job() {
    let mut harness = Harness::dead();
    harness.controller.handle_control(ControlCommand::StartSession).await;
    let mut remote = harness.accept().await;
    assert_eq!(
        next_message(&mut remote).await,
        ClientMessage::ExtensionConnected {
            session_id: "s-new".into()
        }
    );

    remote.send_json(&json!({
        "type": "job_queue",
        "jobs": [
            {"jobId": "a", "jobUrl": "https://site/a"},
            {"jobId": "b", "jobUrl": "https://site/b"}
        ]
    }));

    let started = Instant::now();
    for id in ["a", "b"] {
        assert_eq!(
            next_terminal(&mut remote).await,
            ClientMessage::JobFailed {
                job_id: id.into(),
                error: "Content script failed to load".into(),
            }
        );
    }
    assert_eq!(started.elapsed(), Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn test_results_wait_for_reconnect() {
    let mut harness = Harness::dead();
    harness
        .controller
        .handle_control(ControlCommand::ConnectToSession {
            session_id: "s-1".into(),
        })
        .await;
    let remote = harness.accept().await;
    assert!(harness.controller.status().connected);

    // Keep the reconnect attempts (every 5 s after the close) off the login poll ticks
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.connector.refuse(true);
    remote.send_json(&json!({
        "type": "job_application",
        "jobData": {"jobId": "j1", "jobUrl": "https://site/j1"}
    }));
    remote.close();

    tokio::time::sleep(Duration::from_millis(9500)).await;
    let status = harness.controller.status();
    assert!(!status.connected);
    assert_eq!(status.badge, "OFF");
    assert_eq!(status.pending_results, 1);

    harness.connector.refuse(false);
    let mut again = harness.accept().await;
    assert_eq!(
        next_message(&mut again).await,
        ClientMessage::ExtensionConnected {
            session_id: "s-1".into()
        }
    );
    assert_eq!(
        next_message(&mut again).await,
        ClientMessage::JobFailed {
            job_id: "j1".into(),
            error: "Content script failed to load".into(),
        }
    );
    assert_eq!(harness.controller.status().pending_results, 0);
}

#[tokio::test(start_paused = true)]
async fn test_login_poll_not_duplicated_on_reconnect() {
    let site = site();
    let mut harness = Harness::scripted(&site);
    harness
        .controller
        .handle_control(ControlCommand::ConnectToSession {
            session_id: "s-1".into(),
        })
        .await;

    let mut remote = harness.accept().await;
    next_message(&mut remote).await;
    next_message(&mut remote).await;
    remote.close();

    let mut again = harness.accept().await;
    assert!(harness.controller.is_polling_login());

    // Opened at t, poll ticks at t+5, t+15, t+25 (started 5 s before the reopen)
    let deadline = Instant::now() + Duration::from_secs(27);
    let mut login_reports = 0;
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, again.recv()).await {
        if matches!(message, ClientMessage::LoginStatus { .. }) {
            login_reports += 1;
        }
    }
    assert_eq!(login_reports, 4);
}

#[tokio::test(start_paused = true)]
async fn test_status_and_disconnect() {
    let site = site();
    let mut harness = Harness::scripted(&site);

    let response = harness.controller.handle_control(ControlCommand::StartSession).await;
    assert_eq!(
        response,
        ControlResponse::Session {
            session_id: "s-new".into(),
            is_logged_in: true,
            message: "Session started".into(),
        }
    );
    assert_eq!(
        harness.store.get(keys::SESSION_ID).await.unwrap().as_deref(),
        Some("\"s-new\"")
    );

    let mut remote = harness.accept().await;
    next_message(&mut remote).await;
    next_message(&mut remote).await;

    remote.send_json(&json!({"type": "status_update", "status": "3 jobs queued"}));
    remote.send_json(&json!({"type": "login_required"}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let ControlResponse::Status(status) = harness.controller.handle_control(ControlCommand::GetStatus).await
    else {
        panic!("expected a status report");
    };
    assert!(status.connected);
    assert_eq!(status.session_id.as_deref(), Some("s-new"));
    assert_eq!(status.connection_state, ConnectionState::Connected);
    assert_eq!(status.badge, "ON");
    assert_eq!(status.last_status.as_deref(), Some("3 jobs queued"));
    assert!(status.login_required);
    assert!(status.connected_since.is_some());

    let confirmed = harness
        .controller
        .handle_control(ControlCommand::ConfirmLogin { session_id: None })
        .await;
    assert_eq!(confirmed, ControlResponse::ok("Login confirmed"));
    assert_eq!(
        next_message(&mut remote).await,
        ClientMessage::LoginStatus {
            is_logged_in: true,
            session_id: Some("s-new".into())
        }
    );
    assert!(!harness.controller.status().login_required);

    let attempts = harness.connector.attempts();
    let response = harness.controller.handle_control(ControlCommand::Disconnect).await;
    assert!(response.is_success());
    assert!(harness.store.is_empty().await);
    assert!(!harness.controller.is_polling_login());

    let status = harness.controller.status();
    assert_eq!(status.connection_state, ConnectionState::Disconnected);
    assert_eq!(status.session_id, None);
    assert_eq!(status.last_status, None);
    assert_eq!(status.connected_since, None);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.connector.attempts(), attempts);

    let refused = harness
        .controller
        .handle_control(ControlCommand::ConfirmLogin { session_id: None })
        .await;
    assert!(!refused.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_drops_pending_page_work() {
    let site = site();
    let (mut harness, tabs) = Harness::hosted(&site);
    harness
        .controller
        .handle_control(ControlCommand::ConnectToSession {
            session_id: "s-1".into(),
        })
        .await;
    let mut remote = harness.accept().await;
    next_message(&mut remote).await;
    next_message(&mut remote).await;

    let tab = tabs.create_tab(HOME).await.unwrap();
    let store = tabs.store(&tab.id).unwrap();
    let pending = json!([{"jobId": "z", "jobUrl": JOB_URL}]);
    store.set(keys::JOB_QUEUE, pending.to_string()).await.unwrap();
    store.set(keys::JOB_DATA, pending[0].to_string()).await.unwrap();

    let response = harness.controller.handle_control(ControlCommand::Disconnect).await;
    assert!(response.is_success());
    assert!(store.is_empty().await);
    assert!(tabs.has_agent(&tab.id));

    // A later load of the job page finds nothing to resume
    let page = &site.pages()[0];
    page.open(JOB_URL);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(page.clicks().is_empty());
    assert!(store.is_empty().await);
    assert_eq!(harness.controller.status().pending_results, 0);
}

async fn single_result_despite_lost_replies(lost: usize) {
    let site = site();
    let mut harness = Harness::losing(&site, lost);
    harness
        .controller
        .handle_control(ControlCommand::ConnectToSession {
            session_id: "s-1".into(),
        })
        .await;
    let mut remote = harness.accept().await;
    next_message(&mut remote).await;
    next_message(&mut remote).await;

    remote.send_json(&json!({
        "type": "job_application",
        "jobData": {"jobId": "j1", "jobUrl": JOB_URL, "coverLetterText": "Hello"}
    }));

    assert_eq!(
        next_terminal(&mut remote).await,
        ClientMessage::JobCompleted {
            job_id: "j1".into(),
            success: true,
            message: "Proposal submitted".into(),
        }
    );

    let deadline = Instant::now() + Duration::from_secs(300);
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, remote.recv()).await {
        assert!(!message.is_terminal(), "second result for one job: {:?}", message);
    }
    let pages = site.pages();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_reply_yields_one_result() {
    single_result_despite_lost_replies(1).await;
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_delivery_is_left_to_the_page() {
    single_result_despite_lost_replies(2).await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_store() {
    let site = site();
    let mut harness = Harness::scripted(&site);

    save_json(&harness.store, keys::SESSION_ID, "s-9").await.unwrap();
    save_json(&harness.store, keys::IS_LOGGED_IN, &false).await.unwrap();
    assert!(!harness.controller.resume_from_store().await.unwrap());

    save_json(&harness.store, keys::IS_LOGGED_IN, &true).await.unwrap();
    assert!(harness.controller.resume_from_store().await.unwrap());
    let remote = harness.accept().await;
    assert_eq!(remote.url(), "ws://127.0.0.1:8000/ws/s-9");
    assert_eq!(harness.controller.session_id().as_deref(), Some("s-9"));
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_session_record_is_not_resumed() {
    let site = site();
    let harness = Harness::scripted(&site);

    harness.store.set(keys::SESSION_ID, "{oops".into()).await.unwrap();
    save_json(&harness.store, keys::IS_LOGGED_IN, &true).await.unwrap();
    assert!(!harness.controller.resume_from_store().await.unwrap());
    assert!(harness.store.get(keys::SESSION_ID).await.unwrap().is_none());
}

type FileBacked = (
    Arc<Controller>,
    mpsc::UnboundedReceiver<RemoteEnd>,
    mpsc::UnboundedSender<AgentReport>,
);

fn file_backed_controller(store: JsonFileStore) -> FileBacked {
    let config = config();
    let (connector, remotes) = ChannelConnector::new();
    let (transport, events) =
        SessionTransport::new(Arc::new(connector), config.ws_base_url(), &config.transport);
    let dispatcher = Dispatcher::new(Arc::new(DeadTabs), &config);
    let controller =
        Controller::new(config, transport, dispatcher, Arc::new(store), Arc::new(FixedApi)).unwrap();
    let (reporter, reports) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&controller).run(events, reports));
    (controller, remotes, reporter)
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".applier/state.json");

    let (first, _remotes, _reporter) = file_backed_controller(JsonFileStore::open(&path).await.unwrap());
    let response = first.handle_control(ControlCommand::StartSession).await;
    assert!(response.is_success());
    // Quit without clearing the stored session
    first.transport().disconnect();

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let stored: Option<String> = load_json(&reopened, keys::SESSION_ID).await.unwrap();
    assert_eq!(stored.as_deref(), Some("s-new"));

    let (second, mut remotes, _reporter) = file_backed_controller(reopened);
    assert!(second.resume_from_store().await.unwrap());
    let remote = tokio::time::timeout(Duration::from_secs(5), remotes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.url(), "ws://127.0.0.1:8000/ws/s-new");
}
