//! Page agent behaviour across navigations, driven through the in-process host

use applier_agent::InProcessTabs;
use applier_browser::scripted::{ScriptedDocument, ScriptedPage, ScriptedSite};
use applier_browser::{DomNode, NodeId, Page};
use applier_core::store::save_json;
use applier_core::{
    keys, AgentReport, ApplierConfig, ApplierError, DispatchAck, JobDescriptor, JobOutcome,
    KeyValueStore, LoginState, PageRequest, PageResponse, TabHost, TabId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HOME: &str = "https://www.upwork.com/nx/find-work/";

fn job_url(id: &str) -> String {
    format!("https://www.upwork.com/jobs/~{}", id)
}

fn job(id: &str) -> JobDescriptor {
    JobDescriptor::new(id, job_url(id))
        .with_cover_letter(format!("Cover letter for {}", id))
        .with_post_submit_delay_ms(3000)
}

fn job_document(title: &str) -> ScriptedDocument {
    ScriptedDocument::new(title)
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
        )
}

fn site() -> ScriptedSite {
    let site = ScriptedSite::new();
    site.route(
        HOME,
        ScriptedDocument::new("Find work")
            .with_node(DomNode::element(1, "div").with_attr("data-test", "user-menu")),
    );
    for id in ["a", "b", "c"] {
        site.route(job_url(id), job_document(id));
    }
    site
}

struct Harness {
    site: ScriptedSite,
    host: InProcessTabs,
    reports: mpsc::UnboundedReceiver<AgentReport>,
}

impl Harness {
    fn new(site: ScriptedSite) -> Self {
        let (reporter, reports) = mpsc::unbounded_channel();
        let host = InProcessTabs::new(Arc::new(site.clone()), &ApplierConfig::default(), reporter)
            .unwrap();
        Self { site, host, reports }
    }

    async fn open(&self, url: &str) -> (TabId, ScriptedPage) {
        let page = self.site.open(url);
        let tab = self.host.attach(Arc::new(page.clone())).await;
        (tab, page)
    }

    async fn next_report(&mut self) -> AgentReport {
        tokio::time::timeout(Duration::from_secs(600), self.reports.recv())
            .await
            .expect("no report within ten minutes")
            .expect("report channel closed")
    }
}

#[tokio::test(start_paused = true)]
async fn test_queue_of_n_jobs_yields_n_reports() {
    let mut harness = Harness::new(site());
    let (tab, page) = harness.open(HOME).await;

    let response = harness
        .host
        .send(
            &tab,
            PageRequest::ProcessJobQueue {
                job_queue: vec![job("a"), job("b"), job("c")],
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        response,
        PageResponse::Accepted {
            ack: DispatchAck::Navigating,
            ..
        }
    ));

    let mut finished = Vec::new();
    for _ in 0..3 {
        let report = harness.next_report().await;
        assert_eq!(report.tab, tab);
        assert!(report.outcome.is_success(), "{:?}", report.outcome);
        finished.push(report.outcome.job_id().to_string());
    }
    assert_eq!(finished, vec!["a", "b", "c"]);

    assert_eq!(page.navigations(), vec![job_url("a"), job_url("b"), job_url("c")]);
    assert_eq!(page.clicks().len(), 3);

    let store = harness.host.store(&tab).unwrap();
    assert!(store.get(keys::JOB_QUEUE).await.unwrap().is_none());
    assert!(store.get(keys::JOB_DATA).await.unwrap().is_none());

    // No stray report afterwards
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(harness.reports.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reload_mid_job_resumes_at_head() {
    let mut harness = Harness::new(site());
    let (tab, page) = harness.open(HOME).await;

    harness
        .host
        .send(
            &tab,
            PageRequest::ProcessJobQueue {
                job_queue: vec![job("a"), job("b")],
            },
        )
        .await
        .unwrap();

    // Arrived on a's page, settle delay over, waiting for dynamic content
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(page.url(), job_url("a"));
    assert!(page.clicks().is_empty());

    page.open(&job_url("a"));

    let first = harness.next_report().await;
    let second = harness.next_report().await;
    assert_eq!(first.outcome.job_id(), "a");
    assert_eq!(second.outcome.job_id(), "b");

    let clicked: Vec<String> = page.clicks().into_iter().map(|(url, _)| url).collect();
    assert_eq!(clicked, vec![job_url("a"), job_url("b")]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_does_not_stop_queue() {
    let site = site();
    site.route(
        job_url("broken"),
        ScriptedDocument::new("No button")
            .with_node(DomNode::element(1, "textarea").with_attr("name", "coverLetter")),
    );
    let mut harness = Harness::new(site);
    let (tab, _page) = harness.open(HOME).await;

    harness
        .host
        .send(
            &tab,
            PageRequest::ProcessJobQueue {
                job_queue: vec![job("broken"), job("b")],
            },
        )
        .await
        .unwrap();

    let first = harness.next_report().await;
    assert_eq!(
        first.outcome,
        JobOutcome::failed("broken", "Apply button not found")
    );
    let second = harness.next_report().await;
    assert_eq!(second.outcome.job_id(), "b");
    assert!(second.outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_single_job_on_current_page() {
    let mut harness = Harness::new(site());
    let (tab, page) = harness.open(&job_url("a")).await;

    let response = harness
        .host
        .send(
            &tab,
            PageRequest::ProcessJob {
                job_data: Some(job("a")),
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        response,
        PageResponse::Accepted {
            ack: DispatchAck::Processing | DispatchAck::Initiated,
            ..
        }
    ));

    let report = harness.next_report().await;
    assert_eq!(
        report.outcome,
        JobOutcome::completed("a", true, "Proposal submitted")
    );
    assert!(page.navigations().is_empty());
    assert_eq!(page.value_of(1).as_deref(), Some("Cover letter for a"));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_submission_policy() {
    let site = site();
    site.route(
        job_url("quiet"),
        ScriptedDocument::new("Quiet").with_node(
            DomNode::element(2, "button")
                .with_attr("data-test", "submit-btn")
                .with_text("Submit"),
        ),
    );

    let (reporter, mut reports) = mpsc::unbounded_channel();
    let mut config = ApplierConfig::default();
    config.agent.require_confirmation = true;
    let host = InProcessTabs::new(Arc::new(site.clone()), &config, reporter).unwrap();
    let page = site.open(&job_url("quiet"));
    let tab = host.attach(Arc::new(page.clone())).await;

    host.send(
        &tab,
        PageRequest::ProcessJob {
            job_data: Some(JobDescriptor::new("quiet", job_url("quiet"))),
        },
    )
    .await
    .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(600), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        report.outcome,
        JobOutcome::completed("quiet", false, "Proposal submitted, no confirmation observed")
    );
    assert_eq!(page.clicks(), vec![(job_url("quiet"), NodeId(2))]);
}

#[tokio::test(start_paused = true)]
async fn test_requests_without_agent() {
    let harness = Harness::new(site());
    let (tab, _page) = harness.open("https://example.com/").await;

    let result = harness.host.send(&tab, PageRequest::Ping).await;
    assert!(matches!(result, Err(ApplierError::AgentUnavailable(_))));
    assert!(harness.host.site_tabs().await.unwrap().is_empty());

    let missing = harness.host.send(&TabId::new("tab-99"), PageRequest::Ping).await;
    assert!(matches!(missing, Err(ApplierError::TabNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_login_and_page_info_requests() {
    let harness = Harness::new(site());
    let (tab, _page) = harness.open(HOME).await;

    assert_eq!(
        harness.host.send(&tab, PageRequest::Ping).await.unwrap(),
        PageResponse::Pong
    );
    assert_eq!(
        harness
            .host
            .send(&tab, PageRequest::CheckLoginStatus)
            .await
            .unwrap(),
        PageResponse::LoginStatus {
            state: LoginState::LoggedIn
        }
    );
    assert_eq!(
        harness.host.send(&tab, PageRequest::GetPageInfo).await.unwrap(),
        PageResponse::PageInfo {
            url: HOME.to_string(),
            title: "Find work".to_string(),
            is_target_site: true,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_pending_work_is_dropped_on_load() {
    let mut harness = Harness::new(site());
    let (tab, page) = harness.open(HOME).await;

    let store = harness.host.store(&tab).unwrap();
    store.set(keys::JOB_QUEUE, "{not a list".into()).await.unwrap();
    page.open(HOME);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(store.get(keys::JOB_QUEUE).await.unwrap().is_none());
    assert!(harness.host.has_agent(&tab));
    assert!(harness.reports.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_persisted_job_data_resumes_after_load() {
    let mut harness = Harness::new(site());
    let (tab, page) = harness.open(HOME).await;

    let store = harness.host.store(&tab).unwrap();
    save_json(&store, keys::JOB_DATA, &job("c")).await.unwrap();
    page.open(&job_url("c"));

    let report = harness.next_report().await;
    assert_eq!(report.outcome.job_id(), "c");
    assert!(store.get(keys::JOB_DATA).await.unwrap().is_none());
    assert_eq!(page.snapshot().await.unwrap().title, "c");
}

#[tokio::test(start_paused = true)]
async fn test_redirecting_job_page_fails_after_navigation_budget() {
    let site = site();
    let apply_url = format!("{}/apply", job_url("moved"));
    site.route(job_url("moved"), ScriptedDocument::redirect_to(apply_url.clone()));
    site.route(apply_url, job_document("moved"));
    let mut harness = Harness::new(site);
    let (tab, page) = harness.open(HOME).await;

    harness
        .host
        .send(
            &tab,
            PageRequest::ProcessJobQueue {
                job_queue: vec![job("moved"), job("b")],
            },
        )
        .await
        .unwrap();

    let first = harness.next_report().await;
    assert_eq!(
        first.outcome,
        JobOutcome::failed(
            "moved",
            format!("Navigation did not reach job page {}", job_url("moved"))
        )
    );
    let second = harness.next_report().await;
    assert_eq!(second.outcome.job_id(), "b");
    assert!(second.outcome.is_success());

    let config = ApplierConfig::default();
    let to_moved = page
        .navigations()
        .into_iter()
        .filter(|url| *url == job_url("moved"))
        .count();
    assert_eq!(to_moved, config.agent.max_navigations as usize);

    let store = harness.host.store(&tab).unwrap();
    assert!(store.is_empty().await);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(harness.reports.try_recv().is_err());
}
