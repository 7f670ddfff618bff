// tests/pipeline_flow.rs
//
// End-to-end runs of the orchestrator against in-memory collaborators:
// a scripted site, a summarizer that can be told to fail, and a backend that
// can reject or be unavailable per post. The cursor is a real file.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;

use profile_watch::config::{SummaryFallback, Tuning};
use profile_watch::cursor::CursorStore;
use profile_watch::deliver::PostSink;
use profile_watch::scheduler::run_scheduled;
use profile_watch::session::{FetchWindow, Session, SessionDriver};
use profile_watch::summarize::Summarizer;
use profile_watch::{
    Credentials, DeliveryReceipt, EnrichedPost, MonitorError, Pipeline, Post, Result, RunState,
};

// ---------- fixtures ----------

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

fn post(n: u32, minutes: i64) -> Post {
    Post {
        id: format!("urn:li:activity:{n}"),
        published_at: t(minutes),
        raw_text: format!("text of post {n}"),
        media_url: None,
    }
}

fn id(n: u32) -> String {
    format!("urn:li:activity:{n}")
}

/// Newest first, as the activity page lists them.
fn site_t1_t2_t3() -> Vec<Post> {
    vec![post(3, 3), post(2, 2), post(1, 1)]
}

// ---------- scripted site ----------

#[derive(Default)]
struct Site {
    feed: Vec<Post>,
    scripted: VecDeque<Result<Vec<Post>>>,
    login_errors: VecDeque<MonitorError>,
    logins: usize,
    closes: usize,
    hang_fetch: bool,
    /// How many posts scrolling can ever bring onto the page.
    reachable: Option<usize>,
}

#[derive(Clone, Default)]
struct MockDriver(Arc<Mutex<Site>>);

impl MockDriver {
    fn serving(feed: Vec<Post>) -> Self {
        let d = Self::default();
        d.0.lock().feed = feed;
        d
    }
    fn logins(&self) -> usize {
        self.0.lock().logins
    }
    fn closes(&self) -> usize {
        self.0.lock().closes
    }
}

#[async_trait]
impl SessionDriver for MockDriver {
    async fn login(&self, _credentials: &Credentials) -> Result<Box<dyn Session>> {
        let mut site = self.0.lock();
        site.logins += 1;
        if let Some(e) = site.login_errors.pop_front() {
            return Err(e);
        }
        Ok(Box::new(MockSession {
            site: self.0.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockSession {
    site: Arc<Mutex<Site>>,
    closed: bool,
}

#[async_trait]
impl Session for MockSession {
    async fn fetch_recent_posts(&mut self, _profile: &Url, window: FetchWindow) -> Result<Vec<Post>> {
        let (hang, reachable, next) = {
            let mut site = self.site.lock();
            let next = site
                .scripted
                .pop_front()
                .unwrap_or_else(|| Ok(site.feed.clone()));
            (site.hang_fetch, site.reachable, next)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        next.map(|mut posts| {
            if let Some(n) = reachable {
                posts.truncate(n);
            }
            window.trim(posts)
        })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.site.lock().closes += 1;
        }
        Ok(())
    }
}

// ---------- summarizer ----------

#[derive(Default)]
struct StubSummarizer {
    fail_on: Mutex<HashSet<String>>,
    calls: Mutex<usize>,
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        *self.calls.lock() += 1;
        if self.fail_on.lock().contains(text) {
            return Err(MonitorError::SummarizationFailed("stub outage".into()));
        }
        Ok(format!("summary: {text}"))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

// ---------- backend ----------

struct StubBackend {
    cursor: CursorStore,
    reject: Mutex<HashSet<String>>,
    unavailable: Mutex<HashSet<String>>,
    accepted: Mutex<Vec<EnrichedPost>>,
    cursor_at_delivery: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl StubBackend {
    fn new(cursor_path: &PathBuf) -> Self {
        Self {
            cursor: CursorStore::new(cursor_path),
            reject: Mutex::default(),
            unavailable: Mutex::default(),
            accepted: Mutex::default(),
            cursor_at_delivery: Mutex::default(),
        }
    }

    fn accepted_ids(&self) -> Vec<String> {
        self.accepted.lock().iter().map(|e| e.post.id.clone()).collect()
    }
}

#[async_trait]
impl PostSink for StubBackend {
    async fn deliver(&self, e: &EnrichedPost) -> Result<DeliveryReceipt> {
        // what a crash right now would leave behind
        self.cursor_at_delivery.lock().push(self.cursor.read()?);

        if self.reject.lock().contains(&e.post.id) {
            return Err(MonitorError::DeliveryRejected {
                post_id: e.post.id.clone(),
                status: 422,
                body: "invalid payload".into(),
            });
        }
        if self.unavailable.lock().contains(&e.post.id) {
            return Err(MonitorError::DeliveryUnavailable {
                post_id: e.post.id.clone(),
                attempts: 4,
                reason: "HTTP 503".into(),
            });
        }
        self.accepted.lock().push(e.clone());
        Ok(DeliveryReceipt {
            post_id: e.post.id.clone(),
            status: 201,
            accepted_at: Utc::now(),
            remote_id: None,
        })
    }
}

// ---------- harness ----------

struct Harness {
    dir: tempfile::TempDir,
    cursor_path: PathBuf,
    driver: MockDriver,
    summarizer: Arc<StubSummarizer>,
    backend: Arc<StubBackend>,
}

impl Harness {
    fn new(feed: Vec<Post>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join("last_timestamp.txt");
        let backend = Arc::new(StubBackend::new(&cursor_path));
        Self {
            dir,
            cursor_path,
            driver: MockDriver::serving(feed),
            summarizer: Arc::new(StubSummarizer::default()),
            backend,
        }
    }

    fn pipeline_with(&self, tuning: &Tuning) -> Pipeline {
        Pipeline::new(
            Arc::new(self.driver.clone()),
            self.summarizer.clone(),
            self.backend.clone(),
            CursorStore::new(&self.cursor_path),
            Credentials {
                email: "me@example.test".into(),
                password: "pw".into(),
            },
            Url::parse("https://www.linkedin.com/in/someone/").unwrap(),
            tuning,
        )
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with(&Tuning::default())
    }

    fn cursor(&self) -> Option<DateTime<Utc>> {
        CursorStore::new(&self.cursor_path).read().unwrap()
    }

    fn set_cursor(&self, ts: DateTime<Utc>) {
        CursorStore::new(&self.cursor_path).write(ts).unwrap();
    }
}

fn tuning_with_limit(fetch_limit: usize) -> Tuning {
    Tuning {
        fetch_limit,
        ..Tuning::default()
    }
}

// ---------- worked examples ----------

#[tokio::test]
async fn empty_cursor_delivers_all_posts_oldest_first() {
    let h = Harness::new(site_t1_t2_t3());
    let report = h.pipeline().run_once().await.unwrap();

    assert_eq!(report.fetched, 3);
    assert_eq!(report.selected, 3);
    assert_eq!(report.delivered, vec![id(1), id(2), id(3)]);
    assert_eq!(h.backend.accepted_ids(), vec![id(1), id(2), id(3)]);
    assert_eq!(report.cursor_before, None);
    assert_eq!(report.cursor_after, Some(t(3)));
    assert_eq!(report.final_state, RunState::Idle);
    assert_eq!(h.cursor(), Some(t(3)));
    assert_eq!(h.driver.logins(), 1);
    assert_eq!(h.driver.closes(), 1);

    let accepted = h.backend.accepted.lock();
    let first = &accepted[0];
    assert_eq!(first.summary, "summary: text of post 1");
    assert!(!first.summary_degraded);
}

#[tokio::test]
async fn cursor_at_t2_selects_only_t3() {
    let h = Harness::new(site_t1_t2_t3());
    h.set_cursor(t(2));
    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![id(3)]);
    assert_eq!(h.cursor(), Some(t(3)));
}

#[tokio::test]
async fn rejected_delivery_keeps_cursor_and_is_retried_next_run() {
    let h = Harness::new(site_t1_t2_t3());
    h.backend.reject.lock().insert(id(3));

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.stage, RunState::Delivering);
    assert_eq!(failure.post_id.as_deref(), Some(id(3).as_str()));
    assert_eq!(failure.kind(), "DeliveryRejected");
    assert_eq!(failure.delivered_before_failure, vec![id(1), id(2)]);
    assert_eq!(failure.cursor_after, Some(t(2)));
    assert_eq!(h.cursor(), Some(t(2)));

    h.backend.reject.lock().clear();
    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![id(3)]);
    // 1 and 2 were never sent twice
    assert_eq!(h.backend.accepted_ids(), vec![id(1), id(2), id(3)]);
    assert_eq!(h.cursor(), Some(t(3)));
}

#[tokio::test]
async fn failed_summary_degrades_to_raw_text_and_continues() {
    let h = Harness::new(site_t1_t2_t3());
    h.summarizer.fail_on.lock().insert("text of post 1".into());

    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![id(1), id(2), id(3)]);
    assert_eq!(report.degraded, vec![id(1)]);

    let accepted = h.backend.accepted.lock();
    assert_eq!(accepted[0].summary, "text of post 1");
    assert!(accepted[0].summary_degraded);
    assert!(!accepted[1].summary_degraded);
    drop(accepted);
    assert_eq!(h.cursor(), Some(t(3)));
}

#[tokio::test]
async fn abort_policy_stops_at_failed_summary() {
    let h = Harness::new(site_t1_t2_t3());
    h.summarizer.fail_on.lock().insert("text of post 2".into());
    let tuning = Tuning {
        summary_fallback: SummaryFallback::Abort,
        ..Tuning::default()
    };

    let failure = h.pipeline_with(&tuning).run_once().await.unwrap_err();
    assert_eq!(failure.stage, RunState::Summarizing);
    assert_eq!(failure.kind(), "SummarizationFailed");
    assert_eq!(failure.post_id.as_deref(), Some(id(2).as_str()));
    assert_eq!(h.backend.accepted_ids(), vec![id(1)]);
    assert_eq!(h.cursor(), Some(t(1)));
}

// ---------- properties ----------

#[tokio::test]
async fn second_run_without_new_posts_is_a_no_op() {
    let h = Harness::new(site_t1_t2_t3());
    h.pipeline().run_once().await.unwrap();
    let before = std::fs::read(&h.cursor_path).unwrap();

    let report = h.pipeline().run_once().await.unwrap();
    assert!(report.delivered.is_empty());
    assert_eq!(report.selected, 0);
    assert_eq!(std::fs::read(&h.cursor_path).unwrap(), before);
    assert_eq!(h.backend.accepted_ids().len(), 3);
    assert_eq!(*h.summarizer.calls.lock(), 3);
}

#[tokio::test]
async fn cursor_is_persisted_before_the_next_post_is_sent() {
    let h = Harness::new(vec![post(4, 4), post(3, 3), post(2, 2), post(1, 1)]);
    h.backend.unavailable.lock().insert(id(3));

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.kind(), "DeliveryUnavailable");
    // a crash at any delivery would have left the previous post's time behind
    assert_eq!(
        *h.backend.cursor_at_delivery.lock(),
        vec![None, Some(t(1)), Some(t(2))]
    );
    assert_eq!(h.cursor(), Some(t(2)));

    h.backend.unavailable.lock().clear();
    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![id(3), id(4)]);
    assert_eq!(h.backend.accepted_ids(), vec![id(1), id(2), id(3), id(4)]);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let h = Harness::new(site_t1_t2_t3());
    h.set_cursor(t(10));
    let report = h.pipeline().run_once().await.unwrap();
    assert!(report.delivered.is_empty());
    assert_eq!(h.cursor(), Some(t(10)));

    // an older post sneaking into a later feed does not drag the cursor back
    h.driver.0.lock().feed = vec![post(12, 12), post(9, 9)];
    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![id(12)]);
    assert_eq!(h.cursor(), Some(t(12)));
}

#[tokio::test]
async fn equal_timestamps_advance_only_after_the_whole_group() {
    let a = post(10, 1);
    let b = post(11, 1);
    let c = post(12, 2);
    let h = Harness::new(vec![c.clone(), b.clone(), a.clone()]);
    h.backend.reject.lock().insert(b.id.clone());

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.post_id.as_deref(), Some(b.id.as_str()));
    // a was delivered but shares b's time: the cursor may not claim either
    assert_eq!(h.cursor(), None);
    assert_eq!(h.backend.cursor_at_delivery.lock().len(), 2);

    h.backend.reject.lock().clear();
    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered, vec![a.id.clone(), b.id.clone(), c.id.clone()]);
    assert_eq!(h.cursor(), Some(t(2)));
}

// ---------- fetch stage ----------

fn site_t1_to_t5() -> Vec<Post> {
    (1..=5).rev().map(|n| post(n, n as i64)).collect()
}

#[tokio::test]
async fn backlog_larger_than_fetch_limit_is_read_back_to_the_cursor() {
    let h = Harness::new(site_t1_to_t5());
    h.set_cursor(t(0));
    let report = h.pipeline_with(&tuning_with_limit(3)).run_once().await.unwrap();

    assert_eq!(report.fetched, 5);
    assert_eq!(report.delivered, vec![id(1), id(2), id(3), id(4), id(5)]);
    assert!(!report.fetch_gap);
    assert_eq!(h.cursor(), Some(t(5)));
}

#[tokio::test]
async fn feed_that_cannot_reach_the_cursor_is_flagged() {
    let h = Harness::new(site_t1_to_t5());
    h.set_cursor(t(0));
    h.driver.0.lock().reachable = Some(3);

    let report = h.pipeline_with(&tuning_with_limit(3)).run_once().await.unwrap();
    assert!(report.fetch_gap);
    assert_eq!(report.delivered, vec![id(3), id(4), id(5)]);

    // once the cursor is inside what the feed shows, no gap is reported
    let again = h.pipeline_with(&tuning_with_limit(3)).run_once().await.unwrap();
    assert!(!again.fetch_gap);
    assert!(again.delivered.is_empty());
}

#[tokio::test]
async fn first_run_never_reports_a_gap() {
    let h = Harness::new(site_t1_to_t5());
    h.driver.0.lock().reachable = Some(3);
    let report = h.pipeline_with(&tuning_with_limit(3)).run_once().await.unwrap();
    assert!(!report.fetch_gap);
    assert_eq!(report.delivered, vec![id(3), id(4), id(5)]);
}

#[tokio::test]
async fn fetch_failure_leaves_state_untouched() {
    let h = Harness::new(site_t1_t2_t3());
    h.set_cursor(t(1));
    let before = std::fs::read(&h.cursor_path).unwrap();
    h.driver
        .0
        .lock()
        .scripted
        .push_back(Err(MonitorError::ParseMismatch("layout changed".into())));

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.stage, RunState::Fetching);
    assert_eq!(failure.kind(), "ParseMismatch");
    assert!(failure.post_id.is_none());
    assert_eq!(std::fs::read(&h.cursor_path).unwrap(), before);
    assert!(h.backend.accepted_ids().is_empty());
    assert_eq!(h.driver.closes(), h.driver.logins());
}

#[tokio::test]
async fn login_failure_is_reported_at_session_stage() {
    let h = Harness::new(site_t1_t2_t3());
    h.driver
        .0
        .lock()
        .login_errors
        .push_back(MonitorError::AuthenticationFailed {
            attempts: 2,
            reason: "still on the login page after submitting".into(),
        });

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.stage, RunState::FetchingSession);
    assert_eq!(failure.kind(), "AuthenticationFailed");
    assert_eq!(h.cursor(), None);
    assert!(h.backend.accepted_ids().is_empty());
}

#[tokio::test]
async fn expired_session_gets_one_fresh_login() {
    let h = Harness::new(site_t1_t2_t3());
    h.driver
        .0
        .lock()
        .scripted
        .push_back(Err(MonitorError::SessionExpired("https://x/login".into())));

    let report = h.pipeline().run_once().await.unwrap();
    assert_eq!(report.delivered.len(), 3);
    assert_eq!(h.driver.logins(), 2);
    assert_eq!(h.driver.closes(), 2);
}

#[tokio::test]
async fn session_expiring_twice_fails_the_run() {
    let h = Harness::new(site_t1_t2_t3());
    {
        let mut site = h.driver.0.lock();
        site.scripted
            .push_back(Err(MonitorError::SessionExpired("https://x/login".into())));
        site.scripted
            .push_back(Err(MonitorError::SessionExpired("https://x/authwall".into())));
    }
    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.kind(), "SessionExpired");
    assert_eq!(h.driver.logins(), 2);
    assert_eq!(h.driver.closes(), 2);
}

#[tokio::test]
async fn cancellation_during_fetch_still_closes_the_session() {
    let h = Harness::new(site_t1_t2_t3());
    h.driver.0.lock().hang_fetch = true;
    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline().with_shutdown(rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });
    let failure = tokio::time::timeout(Duration::from_secs(5), pipeline.run_once())
        .await
        .expect("run should stop on shutdown")
        .unwrap_err();
    assert_eq!(failure.kind(), "Cancelled");
    assert_eq!(failure.stage, RunState::Fetching);
    assert_eq!(h.driver.closes(), 1);
    assert_eq!(h.cursor(), None);
}

// ---------- state guards ----------

#[tokio::test]
async fn corrupt_cursor_is_fatal_before_any_browser_work() {
    let h = Harness::new(site_t1_t2_t3());
    std::fs::write(&h.cursor_path, "yesterday-ish\n").unwrap();

    let failure = h.pipeline().run_once().await.unwrap_err();
    assert_eq!(failure.kind(), "StateCorruption");
    assert!(failure.is_fatal());
    assert_eq!(h.driver.logins(), 0);
    // never "repaired" with a guess
    assert_eq!(std::fs::read_to_string(&h.cursor_path).unwrap(), "yesterday-ish\n");
}

#[tokio::test]
async fn held_lock_refuses_a_second_run() {
    let h = Harness::new(site_t1_t2_t3());
    let lock_path = h.dir.path().join("run.lock");
    std::fs::write(&lock_path, "pid=1 since=now\n").unwrap();

    let pipeline = h
        .pipeline()
        .with_lock(&lock_path, Duration::from_secs(3600));
    let failure = pipeline.run_once().await.unwrap_err();
    assert_eq!(failure.kind(), "RunInProgress");
    assert_eq!(h.driver.logins(), 0);

    std::fs::remove_file(&lock_path).unwrap();
    pipeline.run_once().await.unwrap();
    assert!(!lock_path.exists(), "lock must be released after the run");
}

// ---------- scheduler ----------

#[tokio::test]
async fn scheduler_stops_on_corrupt_cursor() {
    let h = Harness::new(site_t1_t2_t3());
    std::fs::write(&h.cursor_path, "garbage").unwrap();
    let (_tx, rx) = watch::channel(false);

    let failure = tokio::time::timeout(
        Duration::from_secs(5),
        run_scheduled(&h.pipeline(), Duration::from_millis(10), rx),
    )
    .await
    .expect("fatal error must end the loop")
    .unwrap_err();
    assert_eq!(failure.kind(), "StateCorruption");
}

#[tokio::test]
async fn scheduler_repeats_until_shutdown_without_duplicates() {
    let h = Harness::new(site_t1_t2_t3());
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        run_scheduled(&h.pipeline(), Duration::from_millis(20), rx),
    )
    .await
    .expect("shutdown must end the loop")
    .unwrap();
    assert!(summary.runs >= 2, "runs = {}", summary.runs);
    assert_eq!(summary.failed_runs, 0);
    assert_eq!(h.backend.accepted_ids(), vec![id(1), id(2), id(3)]);
}

#[tokio::test]
async fn scheduler_keeps_going_after_a_transient_failure() {
    let h = Harness::new(site_t1_t2_t3());
    h.driver
        .0
        .lock()
        .scripted
        .push_back(Err(MonitorError::NavigationTimeout {
            url: "https://x/in/someone/recent-activity/all/".into(),
            secs: 30,
        }));
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });

    let summary = run_scheduled(&h.pipeline(), Duration::from_millis(20), rx)
        .await
        .unwrap();
    assert!(summary.failed_runs >= 1);
    assert_eq!(h.cursor(), Some(t(3)));
}
