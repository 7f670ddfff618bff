// src/session/extract.rs
//! Extraction rules for the profile activity feed.
//!
//! Every assumption about the page structure lives here. When the site changes
//! its markup, this file (and its fixture test) is the only thing to touch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::post::Post;
use crate::session::timestamp::resolve_published_at;

/// CSS selectors describing one post in the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRules {
    /// One element per post, carrying the post URN in `id_attr`.
    pub container: String,
    pub id_attr: String,
    /// Visible publish label ("3h • Edited").
    pub timestamp: String,
    /// Tried in order; the first one that yields text wins.
    pub text: Vec<String>,
    pub image: String,
    pub video: String,
    pub article_link: String,
    /// URL fragments that mean "you are not logged in".
    pub login_markers: Vec<String>,
    /// Appended to the profile URL to reach its activity feed.
    pub activity_path: String,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            container: "div.feed-shared-update-v2[data-urn]".into(),
            id_attr: "data-urn".into(),
            timestamp: r#"span.update-components-actor__sub-description span[aria-hidden="true"]"#
                .into(),
            text: vec![
                r#"div.feed-shared-update-v2__description span[dir="ltr"]"#.into(),
                r#"div.update-components-text span[dir="ltr"]"#.into(),
                "div.feed-shared-inline-show-more-text".into(),
                "div.feed-shared-update-v2__description-wrapper".into(),
                "div.update-components-text".into(),
            ],
            image: "div.update-components-image__container img, div.feed-shared-image__container img"
                .into(),
            video: "div.update-components-linkedin-video__container video, div.feed-shared-linkedin-video__container video"
                .into(),
            article_link: "a.feed-shared-article__figure, a.feed-shared-article__meta, a.update-components-article__meta"
                .into(),
            login_markers: vec![
                "/login".into(),
                "authwall".into(),
                "checkpoint".into(),
                "/uas/".into(),
            ],
            activity_path: "recent-activity/all/".into(),
        }
    }
}

impl ExtractionRules {
    pub fn compile(&self) -> Result<CompiledRules> {
        let sel = |s: &str| {
            Selector::parse(s)
                .map_err(|e| MonitorError::ParseMismatch(format!("bad selector {s:?}: {e}")))
        };
        Ok(CompiledRules {
            container: sel(self.container.as_str())?,
            id_attr: self.id_attr.clone(),
            timestamp: sel(self.timestamp.as_str())?,
            text: self.text.iter().map(|s| sel(s.as_str())).collect::<Result<Vec<_>>>()?,
            image: sel(self.image.as_str())?,
            video: sel(self.video.as_str())?,
            video_source: sel("source")?,
            article_link: sel(self.article_link.as_str())?,
        })
    }

    /// `https://site/in/someone/` -> `https://site/in/someone/recent-activity/all/`.
    pub fn activity_url(&self, profile_url: &url::Url) -> String {
        let base = profile_url.as_str();
        if base.contains(self.activity_path.trim_end_matches('/')) {
            return base.to_string();
        }
        format!("{}/{}", base.trim_end_matches('/'), self.activity_path)
    }

    /// True when the browser was bounced to a login/challenge page.
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_markers.iter().any(|m| url.contains(m.as_str()))
    }

    /// True for a verification challenge rather than a plain login form.
    pub fn is_challenge_url(&self, url: &str) -> bool {
        url.contains("checkpoint")
    }

    /// JS that expands truncated post bodies; returns how many toggles it clicked.
    pub fn see_more_script(&self) -> String {
        format!(
            r#"let n = 0;
document.querySelectorAll({container:?}).forEach(p => {{
  p.querySelectorAll("button").forEach(b => {{
    const t = (b.innerText || "").trim().toLowerCase();
    if (t.endsWith("more") && !b.dataset.pwExpanded) {{ b.dataset.pwExpanded = "1"; b.click(); n += 1; }}
  }});
}});
return n;"#,
            container = self.container
        )
    }

    /// JS returning `[scrollHeight, container count]` for stability polling.
    pub fn progress_script(&self) -> String {
        format!(
            "return [document.body.scrollHeight, document.querySelectorAll({:?}).length];",
            self.container
        )
    }
}

pub struct CompiledRules {
    container: Selector,
    id_attr: String,
    timestamp: Selector,
    text: Vec<Selector>,
    image: Selector,
    video: Selector,
    video_source: Selector,
    article_link: Selector,
}

impl CompiledRules {
    /// Best-effort extraction of up to `limit` posts, in page order (newest first).
    ///
    /// Posts without an id, a parseable time or any text are skipped. A page where
    /// nothing matches, or where every match is skipped, is a `ParseMismatch`.
    pub fn extract_posts(&self, html: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Post>> {
        let doc = Html::parse_document(html);
        let mut matched = 0usize;
        let mut skipped = 0usize;
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for el in doc.select(&self.container) {
            matched += 1;
            let Some(urn) = el
                .value()
                .attr(&self.id_attr)
                .map(str::trim)
                .filter(|u| !u.is_empty())
            else {
                skipped += 1;
                continue;
            };
            if !seen.insert(urn.to_string()) {
                continue;
            }

            let label = el
                .select(&self.timestamp)
                .next()
                .map(element_text)
                .filter(|s| !s.is_empty());
            let Some(published_at) = resolve_published_at(urn, label.as_deref(), now) else {
                warn!(target: "session", urn, label = ?label, "skipping post with unparseable time");
                skipped += 1;
                continue;
            };

            let text = self.post_text(el);
            if text.is_empty() {
                warn!(target: "session", urn, "skipping post with empty text");
                skipped += 1;
                continue;
            }

            out.push(Post {
                id: urn.to_string(),
                published_at,
                raw_text: text,
                media_url: self.media_url(el),
            });
            if out.len() >= limit {
                break;
            }
        }

        debug!(target: "session", matched, skipped, kept = out.len(), "feed extracted");
        if matched == 0 {
            return Err(MonitorError::ParseMismatch(
                "no post container matched on the activity page".to_string(),
            ));
        }
        if out.is_empty() && skipped > 0 {
            return Err(MonitorError::ParseMismatch(format!(
                "{matched} post container(s) matched but none could be parsed"
            )));
        }
        Ok(out)
    }

    fn post_text(&self, el: ElementRef<'_>) -> String {
        for sel in &self.text {
            let parts: Vec<String> = el
                .select(sel)
                .map(element_text)
                .filter(|t| !t.is_empty())
                .collect();
            if !parts.is_empty() {
                return normalize_post_text(&parts.join("\n"));
            }
        }
        String::new()
    }

    fn media_url(&self, el: ElementRef<'_>) -> Option<String> {
        let attr = |e: ElementRef<'_>, name: &str| {
            e.value()
                .attr(name)
                .map(str::trim)
                .filter(|v| !v.is_empty() && !v.starts_with("data:"))
                .map(str::to_string)
        };
        if let Some(src) = el.select(&self.image).next().and_then(|i| attr(i, "src")) {
            return Some(src);
        }
        if let Some(video) = el.select(&self.video).next() {
            let src = attr(video, "src")
                .or_else(|| video.select(&self.video_source).next().and_then(|s| attr(s, "src")));
            if src.is_some() {
                return src;
            }
        }
        el.select(&self.article_link).next().and_then(|a| attr(a, "href"))
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Tidy a post body: unify whitespace per line, keep paragraph breaks,
/// drop the trailing "…see more" toggle text.
pub fn normalize_post_text(s: &str) -> String {
    let unified = s.replace(['\u{00A0}', '\u{202F}'], " ").replace("\r\n", "\n");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"[ \t\u{200B}]+").unwrap());
    let lines: Vec<String> = unified
        .lines()
        .map(|l| re_ws.replace_all(l, " ").trim().to_string())
        .collect();
    let mut out = lines.join("\n");

    static RE_NL: OnceCell<Regex> = OnceCell::new();
    let re_nl = RE_NL.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    out = re_nl.replace_all(&out, "\n\n").to_string();

    static RE_MORE: OnceCell<Regex> = OnceCell::new();
    let re_more =
        RE_MORE.get_or_init(|| Regex::new(r"(?i)\s*(…|\.\.\.)\s*(see )?more\s*$").unwrap());
    out = re_more.replace(&out, "").to_string();

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn page(body: &str) -> String {
        format!("<html><body><main>{body}</main></body></html>")
    }

    fn card(urn: &str, label: &str, text: &str) -> String {
        format!(
            r#"<div class="feed-shared-update-v2" data-urn="{urn}">
  <span class="update-components-actor__sub-description"><span aria-hidden="true">{label}</span></span>
  <div class="update-components-text"><span dir="ltr">{text}</span></div>
</div>"#
        )
    }

    #[test]
    fn normalize_keeps_paragraphs_and_drops_toggle() {
        let s = "Hello\u{00A0}\u{00A0}world  \n\n\n\n  second   line …see more";
        assert_eq!(normalize_post_text(s), "Hello world\n\nsecond line");
    }

    #[test]
    fn extracts_in_page_order_and_respects_limit() {
        let html = page(&[
            card("urn:li:aggregate:3", "1h", "third"),
            card("urn:li:aggregate:2", "2h", "second"),
            card("urn:li:aggregate:1", "3h", "first"),
        ]
        .concat());
        let rules = ExtractionRules::default().compile().unwrap();
        let posts = rules.extract_posts(&html, now(), 2).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, "urn:li:aggregate:3");
        assert_eq!(posts[0].raw_text, "third");
        assert!(posts[0].published_at > posts[1].published_at);
    }

    #[test]
    fn unparseable_cards_are_skipped_not_fatal() {
        let html = page(&[
            card("urn:li:aggregate:2", "Promoted", "ad"),
            card("urn:li:aggregate:1", "3h", "kept"),
            card("urn:li:aggregate:0", "4h", "   "),
        ]
        .concat());
        let rules = ExtractionRules::default().compile().unwrap();
        let posts = rules.extract_posts(&html, now(), 10).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].raw_text, "kept");
    }

    #[test]
    fn layout_change_is_parse_mismatch() {
        let rules = ExtractionRules::default().compile().unwrap();
        let err = rules
            .extract_posts(&page("<article class='new-layout'>hi</article>"), now(), 10)
            .unwrap_err();
        assert_eq!(err.kind(), "ParseMismatch");

        let all_bad = page(&card("urn:li:aggregate:1", "someday", "text"));
        let err = rules.extract_posts(&all_bad, now(), 10).unwrap_err();
        assert_eq!(err.kind(), "ParseMismatch");
    }

    #[test]
    fn login_urls_are_detected() {
        let r = ExtractionRules::default();
        assert!(r.is_login_url("https://www.linkedin.com/login?session_redirect=x"));
        assert!(r.is_login_url("https://www.linkedin.com/authwall?trk=1"));
        assert!(r.is_challenge_url("https://www.linkedin.com/checkpoint/challenge/abc"));
        assert!(!r.is_login_url("https://www.linkedin.com/in/someone/recent-activity/all/"));
    }

    #[test]
    fn activity_url_is_built_once() {
        let r = ExtractionRules::default();
        let p = url::Url::parse("https://www.linkedin.com/in/someone").unwrap();
        let a = r.activity_url(&p);
        assert_eq!(a, "https://www.linkedin.com/in/someone/recent-activity/all/");
        assert_eq!(r.activity_url(&url::Url::parse(&a).unwrap()), a);
    }
}
