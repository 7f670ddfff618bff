// src/session/webdriver.rs
//! WebDriver-backed session (chromedriver or any W3C endpoint).
//!
//! Every wait here is a poll against a deadline; nothing sleeps for a fixed
//! amount and hopes the page caught up.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{MonitorError, Result};
use crate::post::{Credentials, Post};
use crate::session::extract::ExtractionRules;
use crate::session::{FetchWindow, Session, SessionDriver};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const USERNAME_FIELD: &str = "#username";
const PASSWORD_FIELD: &str = "#password";
const SUBMIT_BUTTON: &str = r#"button[type="submit"]"#;
const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); return null;";

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    pub webdriver_url: String,
    pub profile_url: Url,
    pub login_url: Url,
    pub manual_mode: bool,
    pub proxy: Option<String>,
    pub profile_dir: Option<PathBuf>,
    pub screenshot_dir: Option<PathBuf>,
    pub login_attempts: u32,
    pub login_timeout: Duration,
    pub manual_login_wait: Duration,
    pub navigation_timeout: Duration,
    pub render_wait: Duration,
    pub poll_interval: Duration,
    pub max_scrolls: u32,
    pub scroll_wait: Duration,
}

impl WebDriverSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let t = &cfg.tuning;
        Self {
            webdriver_url: cfg.browser.webdriver_url.clone(),
            profile_url: cfg.target.profile_url.clone(),
            login_url: cfg.target.login_url.clone(),
            manual_mode: cfg.browser.manual_mode,
            proxy: cfg.browser.proxy.clone(),
            profile_dir: cfg.browser.profile_dir.clone(),
            screenshot_dir: cfg.browser.screenshot_dir.clone(),
            login_attempts: t.login_attempts,
            login_timeout: Duration::from_secs(t.login_timeout_secs),
            manual_login_wait: Duration::from_secs(t.manual_login_wait_secs),
            navigation_timeout: Duration::from_secs(t.navigation_timeout_secs),
            render_wait: Duration::from_secs(t.render_wait_secs),
            poll_interval: t.poll_interval(),
            max_scrolls: t.max_scrolls,
            scroll_wait: Duration::from_millis(t.scroll_wait_ms),
        }
    }

    /// W3C capabilities for Chrome. Headless unless an operator is expected
    /// to solve challenges by hand.
    pub fn capabilities(&self) -> Map<String, Value> {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--window-size=1366,900".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            format!("--user-agent={USER_AGENT}"),
        ];
        if !self.manual_mode {
            args.push("--headless=new".to_string());
        }
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        if let Some(dir) = &self.profile_dir {
            args.push(format!("--user-data-dir={}", dir.display()));
        }

        let mut caps = Map::new();
        caps.insert("browserName".to_string(), json!("chrome"));
        caps.insert(
            "goog:chromeOptions".to_string(),
            json!({
                "args": args,
                "excludeSwitches": ["enable-automation"],
                "prefs": {
                    "credentials_enable_service": false,
                    "profile.password_manager_enabled": false
                }
            }),
        );
        caps
    }
}

pub struct WebDriverDriver {
    settings: WebDriverSettings,
    rules: ExtractionRules,
}

impl WebDriverDriver {
    pub fn new(settings: WebDriverSettings, rules: ExtractionRules) -> Self {
        Self { settings, rules }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(WebDriverSettings::from_config(cfg), ExtractionRules::default())
    }

    async fn connect(&self) -> Result<Client> {
        let mut builder = ClientBuilder::native();
        builder.capabilities(self.settings.capabilities());
        let client = builder.connect(&self.settings.webdriver_url).await?;
        debug!(target: "session", endpoint = %self.settings.webdriver_url, "webdriver session opened");
        Ok(client)
    }
}

#[async_trait]
impl SessionDriver for WebDriverDriver {
    async fn login(&self, credentials: &Credentials) -> Result<Box<dyn Session>> {
        // fail on broken selectors before a browser is started
        self.rules.compile().map(drop)?;

        let client = self.connect().await?;
        let mut session = WebDriverSession {
            client: Some(client),
            rules: self.rules.clone(),
            settings: self.settings.clone(),
        };
        match session.authenticate(credentials).await {
            Ok(()) => Ok(Box::new(session)),
            Err(e) => {
                session.screenshot("login-failed").await;
                if let Err(close_err) = session.close().await {
                    debug!(target: "session", error = %close_err, "close after failed login");
                }
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "webdriver"
    }
}

enum LoginStep {
    SignedIn,
    Challenge,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    height: u64,
    posts: u64,
}

pub struct WebDriverSession {
    client: Option<Client>,
    rules: ExtractionRules,
    settings: WebDriverSettings,
}

impl WebDriverSession {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| MonitorError::Browser("session already closed".to_string()))
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let client = self.client()?;
        match timeout(self.settings.navigation_timeout, client.goto(url)).await {
            Ok(res) => res.map_err(MonitorError::from),
            Err(_) => Err(MonitorError::NavigationTimeout {
                url: url.to_string(),
                secs: self.settings.navigation_timeout.as_secs(),
            }),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.client()?.current_url().await?.to_string())
    }

    /// Poll the address bar until `done` holds; `None` when `within` runs out.
    async fn poll_url<F>(&self, within: Duration, done: F) -> Result<Option<String>>
    where
        F: Fn(&str) -> bool + Send,
    {
        let deadline = Instant::now() + within;
        loop {
            let here = self.current_url().await?;
            if done(&here) {
                return Ok(Some(here));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn wait_for_container(&self) -> Result<bool> {
        let found = self
            .client()?
            .wait()
            .at_most(self.settings.render_wait)
            .every(self.settings.poll_interval)
            .for_element(Locator::Css(&self.rules.container))
            .await;
        match found {
            Ok(_) => Ok(true),
            Err(CmdError::WaitTimeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the activity feed and report whether posts render without a login.
    async fn feed_renders(&self) -> Result<bool> {
        let activity = self.rules.activity_url(&self.settings.profile_url);
        self.navigate(&activity).await?;
        let here = self.current_url().await?;
        if self.rules.is_login_url(&here) {
            return Ok(false);
        }
        self.wait_for_container().await
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        match self.feed_renders().await {
            Ok(true) => {
                info!(target: "session", "stored browser profile is already signed in");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(target: "session", error = %e, "signed-in probe failed"),
        }

        let attempts = self.settings.login_attempts;
        let mut reason = String::from("login form never submitted");
        for attempt in 1..=attempts {
            debug!(target: "session", attempt, attempts, "submitting login form");
            match self.submit_login_form(credentials).await {
                Ok(LoginStep::SignedIn) => match self.feed_renders().await {
                    Ok(true) => {
                        info!(target: "session", attempt, "logged in");
                        return Ok(());
                    }
                    Ok(false) => reason = "activity feed did not render after login".to_string(),
                    Err(e) if counts_as_failed_attempt(&e) => reason = e.to_string(),
                    Err(e) => return Err(e),
                },
                Ok(LoginStep::Challenge) => {
                    reason = "verification challenge was not completed".to_string()
                }
                Ok(LoginStep::Rejected) => {
                    reason = "still on the login page after submitting".to_string()
                }
                Err(e) if counts_as_failed_attempt(&e) => reason = e.to_string(),
                Err(e) => return Err(e),
            }
            warn!(target: "session", attempt, attempts, %reason, "login attempt failed");
        }
        Err(MonitorError::AuthenticationFailed { attempts, reason })
    }

    async fn submit_login_form(&self, credentials: &Credentials) -> Result<LoginStep> {
        self.navigate(self.settings.login_url.as_str()).await?;
        let here = self.current_url().await?;
        if !self.rules.is_login_url(&here) {
            // cookie still valid; the site bounced us straight past the form
            return Ok(LoginStep::SignedIn);
        }

        let client = self.client()?;
        let user = client
            .wait()
            .at_most(self.settings.render_wait)
            .every(self.settings.poll_interval)
            .for_element(Locator::Css(USERNAME_FIELD))
            .await?;
        user.clear().await?;
        user.send_keys(&credentials.email).await?;
        let pass = client.find(Locator::Css(PASSWORD_FIELD)).await?;
        pass.clear().await?;
        pass.send_keys(&credentials.password).await?;
        client.find(Locator::Css(SUBMIT_BUTTON)).await?.click().await?;

        let rules = &self.rules;
        let landed = self
            .poll_url(self.settings.login_timeout, |u| {
                !rules.is_login_url(u) || rules.is_challenge_url(u)
            })
            .await?;
        match landed {
            None => Ok(LoginStep::Rejected),
            Some(u) if rules.is_challenge_url(&u) => {
                if !self.settings.manual_mode {
                    warn!(target: "session", "verification challenge in headless mode");
                    return Ok(LoginStep::Challenge);
                }
                info!(
                    target: "session",
                    wait_secs = self.settings.manual_login_wait.as_secs(),
                    "verification challenge; waiting for the operator"
                );
                let solved = self
                    .poll_url(self.settings.manual_login_wait, |u| !rules.is_login_url(u))
                    .await?;
                Ok(if solved.is_some() {
                    LoginStep::SignedIn
                } else {
                    LoginStep::Challenge
                })
            }
            Some(_) => Ok(LoginStep::SignedIn),
        }
    }

    async fn progress(&self) -> Result<Progress> {
        let v = self
            .client()?
            .execute(&self.rules.progress_script(), Vec::new())
            .await?;
        let at = |i: usize| v.get(i).and_then(Value::as_u64).unwrap_or(0);
        Ok(Progress {
            height: at(0),
            posts: at(1),
        })
    }

    /// Click every "see more" toggle; failures only cost truncated text.
    async fn expand_see_more(&self) {
        let Ok(client) = self.client() else { return };
        match client.execute(&self.rules.see_more_script(), Vec::new()).await {
            Ok(v) => {
                let clicked = v.as_u64().unwrap_or(0);
                if clicked > 0 {
                    debug!(target: "session", clicked, "expanded truncated posts");
                }
            }
            Err(e) => debug!(target: "session", error = %e, "see-more expansion failed"),
        }
    }

    /// Poll until the page grew past `before` or `scroll_wait` ran out.
    async fn wait_for_growth(&self, before: Progress) -> Result<Progress> {
        let deadline = Instant::now() + self.settings.scroll_wait;
        loop {
            let now = self.progress().await?;
            if now.height > before.height || now.posts > before.posts || Instant::now() >= deadline {
                return Ok(now);
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Poll until two consecutive reads agree (text expansion reflowed).
    async fn wait_until_settled(&self) -> Result<()> {
        let deadline = Instant::now() + self.settings.scroll_wait;
        let mut last = self.progress().await?;
        while Instant::now() < deadline {
            sleep(self.settings.poll_interval).await;
            let now = self.progress().await?;
            if now == last {
                break;
            }
            last = now;
        }
        Ok(())
    }

    /// Posts currently on the page, newest first.
    async fn loaded_posts(&self) -> Result<Vec<Post>> {
        let html = self.client()?.source().await?;
        self.rules.compile()?.extract_posts(&html, Utc::now(), usize::MAX)
    }

    /// Scroll until the page covers `window`, the page stops growing for two
    /// consecutive polls, or `max_scrolls` is spent.
    async fn load_more(&self, window: FetchWindow) -> Result<()> {
        let client = self.client()?;
        let limit = window.limit as u64;
        let mut stalls = 0u32;
        for scroll in 0..self.settings.max_scrolls {
            self.expand_see_more().await;
            let before = self.progress().await?;
            if before.posts >= limit
                && (window.until.is_none() || window.is_covered_by(&self.loaded_posts().await?))
            {
                break;
            }
            client.execute(SCROLL_SCRIPT, Vec::new()).await?;
            let after = self.wait_for_growth(before).await?;
            debug!(target: "session", scroll, height = after.height, posts = after.posts, "scrolled");
            if after.height > before.height || after.posts > before.posts {
                stalls = 0;
            } else {
                stalls += 1;
                if stalls >= 2 {
                    break;
                }
            }
        }
        self.expand_see_more().await;
        self.wait_until_settled().await
    }

    async fn screenshot(&self, tag: &str) {
        let (Some(dir), Some(client)) = (&self.settings.screenshot_dir, &self.client) else {
            return;
        };
        let png = match client.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(target: "session", error = %e, "screenshot failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(target: "session", dir = %dir.display(), error = %e, "cannot create screenshot dir");
            return;
        }
        let path = dir.join(format!("{}-{tag}.png", Utc::now().format("%Y%m%dT%H%M%SZ")));
        match tokio::fs::write(&path, png).await {
            Ok(()) => info!(target: "session", path = %path.display(), "screenshot saved"),
            Err(e) => warn!(target: "session", path = %path.display(), error = %e, "screenshot not written"),
        }
    }
}

fn counts_as_failed_attempt(e: &MonitorError) -> bool {
    matches!(
        e,
        MonitorError::Browser(_) | MonitorError::NavigationTimeout { .. }
    )
}

#[async_trait]
impl Session for WebDriverSession {
    async fn fetch_recent_posts(&mut self, profile_url: &Url, window: FetchWindow) -> Result<Vec<Post>> {
        let activity = self.rules.activity_url(profile_url);
        self.navigate(&activity).await?;
        let here = self.current_url().await?;
        if self.rules.is_login_url(&here) {
            return Err(MonitorError::SessionExpired(here));
        }

        if !self.wait_for_container().await? {
            let here = self.current_url().await?;
            if self.rules.is_login_url(&here) {
                return Err(MonitorError::SessionExpired(here));
            }
            self.screenshot("no-posts").await;
            return Err(MonitorError::ParseMismatch(format!(
                "no post container rendered within {}s",
                self.settings.render_wait.as_secs()
            )));
        }

        self.load_more(window).await?;
        let posts = window.trim(self.loaded_posts().await?);
        info!(target: "session", fetched = posts.len(), limit = window.limit, "activity feed read");
        Ok(posts)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await?;
            debug!(target: "session", "webdriver session closed");
        }
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        debug!(target: "session", error = %e, "deferred webdriver close failed");
                    }
                });
            }
            Err(_) => warn!(target: "session", "session dropped outside a runtime; browser left open"),
        }
    }
}
