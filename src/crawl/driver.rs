//! Headless browser driver
//!
//! Drives a shared Chromium instance over CDP: one page per crawl, a
//! semaphore bounding concurrent pages, a whole-call deadline, and a typed
//! error taxonomy that the retry pipeline consumes. The driver is stateless
//! with respect to the rest of the service; it never touches the queue or
//! the database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, Headers, ResourceType, SetExtraHttpHeadersParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::types::{ExtractedPage, ImageInfo};
use crate::util::to_absolute_url;

/// User agents rotated in sneaky mode
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36",
];

/// Viewports rotated in sneaky mode
const VIEWPORTS: &[(i64, i64)] = &[(1920, 1080), (1366, 768), (1536, 864), (2560, 1440)];

/// Referers rotated in sneaky mode
const REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

/// How long to wait for the main-document response event after navigation
/// before assuming a 200.
const STATUS_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for the body element to appear.
const BODY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors a crawl attempt can end in
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("page load deadline exceeded")]
    Timeout,
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("content is restricted or requires authentication: received status code {0}")]
    ContentRestricted(i32),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

impl CrawlError {
    /// Short classification used as the `error_type` metric label and for
    /// failure bookkeeping.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NavigationFailed(_) => "navigation",
            Self::ContentRestricted(_) => "restricted",
            Self::ExtractionFailed(_) => "extraction",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<i32> {
        match self {
            Self::ContentRestricted(status) => Some(*status),
            _ => None,
        }
    }
}

/// The browser-driving seam of the crawl pipeline. Workers depend on this
/// trait, never on the concrete Chromium driver, so tests can script
/// outcomes.
#[async_trait]
pub trait CrawlDriver: Send + Sync {
    async fn crawl(&self, url: &Url, sneaky: bool) -> Result<ExtractedPage, CrawlError>;
}

/// Raw DOM extraction as returned by the in-page script, before URL
/// resolution and keyword splitting.
#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: String,
    #[serde(default)]
    h1: Vec<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    #[serde(default)]
    src: String,
    #[serde(default)]
    alt: String,
    #[serde(default)]
    data_src: String,
}

/// Single-expression extraction script evaluated in the page context.
const EXTRACT_JS: &str = r#"
(() => {
  const meta = (name) => {
    const el = document.querySelector('meta[name="' + name + '"]');
    return (el && el.getAttribute('content')) || '';
  };
  const texts = (sel) => Array.from(document.querySelectorAll(sel))
    .map((el) => el.textContent.trim())
    .filter((t) => t.length > 0);
  return {
    title: document.title || '',
    description: meta('description'),
    keywords: meta('keywords'),
    h1: texts('h1'),
    content: texts('p').join('\n'),
    images: Array.from(document.querySelectorAll('img')).map((img) => ({
      src: img.getAttribute('src') || '',
      alt: img.getAttribute('alt') || '',
      data_src: img.getAttribute('data-src') || ''
    }))
  };
})()
"#;

/// RAII guard ensuring a page is closed on every exit path.
///
/// chromiumoxide pages hold CDP targets that outlive the `Page` value; a
/// crawl that errors or times out must still release its target or the
/// browser accumulates zombies. Drop spawns the close since it cannot
/// await.
struct PageGuard {
    page: Option<Page>,
    url: String,
}

impl PageGuard {
    fn new(page: Page, url: String) -> Self {
        Self {
            page: Some(page),
            url,
        }
    }

    fn page(&self) -> &Page {
        self.page.as_ref().expect("page already closed")
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!(url = %self.url, error = %e, "failed to close page");
            }
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let url = self.url.clone();
            tokio::spawn(async move {
                if let Err(e) = page.close().await {
                    debug!(url = %url, error = %e, "page cleanup on drop failed");
                }
            });
        }
    }
}

/// Chromium-backed implementation of [`CrawlDriver`].
pub struct ChromeDriver {
    browser: Mutex<Browser>,
    handler_task: JoinHandle<()>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ChromeDriver {
    /// Launch a headless Chromium and keep its CDP connection alive.
    ///
    /// `max_concurrency` bounds how many pages may be open at once; callers
    /// block on acquisition when the pool is exhausted.
    pub async fn launch(max_concurrency: usize, timeout: Duration) -> Result<Self> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch headless browser")?;

        // The handler stream must be driven for the CDP connection to make
        // progress; it ends when the browser process exits.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!(max_concurrency, "headless browser launched");

        Ok(Self {
            browser: Mutex::new(browser),
            handler_task,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            timeout,
        })
    }

    /// Close the browser and stop the CDP handler.
    pub async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "failed to close browser cleanly");
        }
        if let Err(e) = browser.wait().await {
            warn!(error = %e, "failed to wait for browser exit");
        }
        self.handler_task.abort();
    }

    async fn crawl_inner(&self, url: &Url, sneaky: bool) -> Result<ExtractedPage, CrawlError> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?
        };
        let guard = PageGuard::new(page, url.as_str().to_string());

        if sneaky {
            apply_sneaky_profile(guard.page()).await?;
        }

        guard
            .page()
            .execute(EnableParams::default())
            .await
            .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;

        // Subscribe before navigating so the main-document response cannot
        // slip past us.
        let status_rx = spawn_status_listener(guard.page()).await?;

        let start = Instant::now();
        guard
            .page()
            .goto(url.as_str())
            .await
            .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;
        guard
            .page()
            .wait_for_navigation()
            .await
            .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;
        wait_for_body(guard.page()).await?;

        let status = match tokio::time::timeout(STATUS_EVENT_TIMEOUT, status_rx).await {
            Ok(Ok(status)) => status,
            _ => {
                warn!(url = %url, "no main document response observed, assuming 200");
                200
            }
        };
        classify_status(status)?;

        let raw: RawExtraction = guard
            .page()
            .evaluate(EXTRACT_JS)
            .await
            .map_err(|e| CrawlError::ExtractionFailed(e.to_string()))?
            .into_value()
            .map_err(|e| CrawlError::ExtractionFailed(e.to_string()))?;

        // Relative URLs resolve against wherever the redirects landed, not
        // the submitted URL.
        let final_url = guard
            .page()
            .url()
            .await
            .ok()
            .flatten()
            .and_then(|s| Url::parse(&s).ok())
            .unwrap_or_else(|| url.clone());

        let elapsed = start.elapsed();
        guard.close().await;

        let page = build_page(url.as_str(), &final_url, raw, status, elapsed);
        debug!(
            url = %page.url,
            title = %page.title,
            status = page.http_status_code,
            duration_ms = page.response_time_ms,
            "page extracted"
        );
        Ok(page)
    }
}

#[async_trait]
impl CrawlDriver for ChromeDriver {
    async fn crawl(&self, url: &Url, sneaky: bool) -> Result<ExtractedPage, CrawlError> {
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| CrawlError::NavigationFailed("browser pool closed".to_string()))?;
            self.crawl_inner(url, sneaky).await
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(CrawlError::Timeout),
        }
    }
}

/// Randomize viewport, user agent, and Referer for the page.
async fn apply_sneaky_profile(page: &Page) -> Result<(), CrawlError> {
    // Pick everything up front: the RNG handle must not be held across an
    // await point.
    let (width, height, user_agent, referer) = {
        let mut rng = rand::thread_rng();
        let (w, h) = VIEWPORTS[rng.gen_range(0..VIEWPORTS.len())];
        let ua = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
        let referer = REFERERS[rng.gen_range(0..REFERERS.len())];
        (w, h, ua, referer)
    };

    let viewport = SetDeviceMetricsOverrideParams::builder()
        .width(width)
        .height(height)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(CrawlError::NavigationFailed)?;
    page.execute(viewport)
        .await
        .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;

    page.set_user_agent(user_agent)
        .await
        .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;

    let headers = Headers::new(serde_json::json!({ "Referer": referer }));
    page.execute(SetExtraHttpHeadersParams::new(headers))
        .await
        .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;

    Ok(())
}

/// Forward the status of the first Document-type response to a oneshot.
async fn spawn_status_listener(page: &Page) -> Result<oneshot::Receiver<i64>, CrawlError> {
    let mut events = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| CrawlError::NavigationFailed(e.to_string()))?;

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event.r#type == ResourceType::Document {
                let _ = tx.send(event.response.status);
                break;
            }
        }
    });
    Ok(rx)
}

/// Poll until the body element exists; the outer crawl deadline bounds this.
async fn wait_for_body(page: &Page) -> Result<(), CrawlError> {
    loop {
        match page.find_element("body").await {
            Ok(_) => return Ok(()),
            Err(_) => tokio::time::sleep(BODY_POLL_INTERVAL).await,
        }
    }
}

/// Map the main-document status onto the error taxonomy.
fn classify_status(status: i64) -> Result<(), CrawlError> {
    if status >= 500 {
        Err(CrawlError::NavigationFailed(format!(
            "server returned status code {}",
            status
        )))
    } else if status >= 400 {
        Err(CrawlError::ContentRestricted(status as i32))
    } else {
        Ok(())
    }
}

/// Split a comma-separated keywords attribute into trimmed entries.
fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Assemble the final page from the raw extraction.
///
/// The submitted URL stays the row identity; `final_url` only serves as the
/// base for resolving relative image references.
fn build_page(
    submitted_url: &str,
    final_url: &Url,
    raw: RawExtraction,
    status: i64,
    elapsed: Duration,
) -> ExtractedPage {
    let images = raw
        .images
        .into_iter()
        .filter_map(|img| {
            let src = to_absolute_url(final_url, &img.src).unwrap_or_default();
            let data_src = to_absolute_url(final_url, &img.data_src).unwrap_or_default();
            if src.is_empty() && data_src.is_empty() {
                return None;
            }
            Some(ImageInfo {
                src,
                alt: img.alt,
                data_src,
            })
        })
        .collect();

    ExtractedPage {
        url: submitted_url.to_string(),
        title: raw.title,
        description: raw.description,
        keywords: split_keywords(&raw.keywords),
        h1_tags: raw.h1,
        content: raw.content,
        images,
        crawl_timestamp: chrono::Utc::now(),
        http_status_code: status as i32,
        response_time_ms: elapsed.as_millis() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(images: Vec<RawImage>) -> RawExtraction {
        RawExtraction {
            title: "Example Domain".to_string(),
            description: "An example".to_string(),
            keywords: "one, two ,  three,,".to_string(),
            h1: vec!["Example Domain".to_string()],
            content: "First paragraph.\nSecond paragraph.".to_string(),
            images,
        }
    }

    #[test]
    fn classify_status_maps_ranges() {
        assert!(classify_status(200).is_ok());
        assert!(classify_status(301).is_ok());
        assert!(matches!(
            classify_status(403),
            Err(CrawlError::ContentRestricted(403))
        ));
        assert!(matches!(
            classify_status(503),
            Err(CrawlError::NavigationFailed(_))
        ));
    }

    #[test]
    fn error_type_labels_are_stable() {
        assert_eq!(CrawlError::Timeout.error_type(), "timeout");
        assert_eq!(
            CrawlError::NavigationFailed("dns".to_string()).error_type(),
            "navigation"
        );
        assert_eq!(CrawlError::ContentRestricted(401).error_type(), "restricted");
        assert_eq!(
            CrawlError::ExtractionFailed("no body".to_string()).error_type(),
            "extraction"
        );
    }

    #[test]
    fn restricted_error_carries_status() {
        assert_eq!(CrawlError::ContentRestricted(429).http_status(), Some(429));
        assert_eq!(CrawlError::Timeout.http_status(), None);
    }

    #[test]
    fn split_keywords_trims_and_drops_empties() {
        assert_eq!(split_keywords("one, two ,  three,,"), vec!["one", "two", "three"]);
        assert!(split_keywords("").is_empty());
        assert!(split_keywords(" , ,").is_empty());
    }

    #[test]
    fn build_page_resolves_images_against_final_url() {
        let final_url = Url::parse("https://example.com/articles/post").unwrap();
        let page = build_page(
            "https://example.com",
            &final_url,
            raw(vec![
                RawImage {
                    src: "/img/logo.png".to_string(),
                    alt: "logo".to_string(),
                    data_src: String::new(),
                },
                RawImage {
                    src: String::new(),
                    alt: "lazy".to_string(),
                    data_src: "lazy.jpg".to_string(),
                },
                RawImage {
                    src: String::new(),
                    alt: "tracking pixel".to_string(),
                    data_src: String::new(),
                },
            ]),
            200,
            Duration::from_millis(1234),
        );

        assert_eq!(page.url, "https://example.com");
        assert_eq!(page.images.len(), 2);
        assert_eq!(page.images[0].src, "https://example.com/img/logo.png");
        assert_eq!(
            page.images[1].data_src,
            "https://example.com/articles/lazy.jpg"
        );
        assert_eq!(page.http_status_code, 200);
        assert_eq!(page.response_time_ms, 1234);
    }

    #[test]
    fn build_page_keeps_submitted_url_as_identity() {
        let final_url = Url::parse("https://www.example.com/landed").unwrap();
        let page = build_page("https://example.com", &final_url, raw(vec![]), 200, Duration::ZERO);
        assert_eq!(page.url, "https://example.com");
        assert_eq!(page.keywords, vec!["one", "two", "three"]);
        assert_eq!(page.h1_tags, vec!["Example Domain"]);
    }

    #[test]
    fn sneaky_pools_are_populated() {
        assert!(!USER_AGENTS.is_empty());
        assert!(!REFERERS.is_empty());
        assert_eq!(VIEWPORTS.len(), 4);
        assert!(VIEWPORTS.contains(&(1920, 1080)));
    }
}
