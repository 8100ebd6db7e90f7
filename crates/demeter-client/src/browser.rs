use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::{EventRequestWillBeSent, ResourceType};
use chromiumoxide::{Browser, BrowserConfig};
use demeter_core::error::AppError;
use demeter_core::traits::{NetworkRequest, RenderClient, RenderedPage};
use futures::StreamExt;

/// Headless-browser render collaborator using Chromium via the Chrome
/// DevTools Protocol.
///
/// Returns the post-JavaScript DOM plus every network request observed
/// while rendering — the trace is how Site Map mode surfaces undocumented
/// API endpoints behind a server-rendered portal.
///
/// A single Chromium process is shared across all clones of this struct;
/// each [`RenderClient::render`] call opens a new tab, subscribes to its
/// network events, grabs the rendered HTML, and closes the tab.
#[derive(Clone)]
pub struct ChromiumRenderer {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl ChromiumRenderer {
    /// Launches a headless Chromium browser with a **30 s** navigation
    /// timeout.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH` (or the
    /// default locations checked by `chromiumoxide`).
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    /// Launches a headless Chromium browser with a custom navigation
    /// timeout.
    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags (--headless, --disable-gpu, …).  We try to
        // locate the *real* binary buried inside the snap, falling back
        // to any other Chrome/Chromium the user may have installed.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::RenderError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// On systems where Chromium is installed via **snap**, the wrapper at
    /// `/snap/bin/chromium` strips unknown CLI flags, breaking headless
    /// mode. We look for the real binary inside the snap first, then fall
    /// back to well-known system paths.  If nothing is found we return
    /// `None` and let `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            // Snap (Ubuntu default)
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            // Flatpak
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            // Common apt / manual installs
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        // Also honour an explicit override via env var.
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

/// Canonical CDP resource-type label for the network trace.
fn resource_type_label(resource_type: Option<&ResourceType>) -> String {
    match resource_type {
        Some(ResourceType::Xhr) => "XHR".to_string(),
        Some(ResourceType::Fetch) => "Fetch".to_string(),
        Some(other) => format!("{other:?}"),
        None => "Other".to_string(),
    }
}

impl RenderClient for ChromiumRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage, AppError> {
        let timeout = self.timeout;

        let result = tokio::time::timeout(timeout, async {
            // Open the tab on a blank page first so the network listener
            // is in place before navigation starts.
            let page = self.browser.new_page("about:blank").await.map_err(|e| {
                AppError::RenderError(format!("Failed to open tab for {url}: {e}"))
            })?;

            let mut events = page
                .event_listener::<EventRequestWillBeSent>()
                .await
                .map_err(|e| AppError::RenderError(format!("Network listener failed: {e}")))?;

            page.goto(url)
                .await
                .map_err(|e| AppError::RenderError(format!("Failed to navigate to {url}: {e}")))?;

            // Wait until <body> is present — a minimal signal that the
            // page has rendered its main content.
            page.find_element("body")
                .await
                .map_err(|e| AppError::RenderError(format!("Page did not render body: {e}")))?;

            let html = page
                .content()
                .await
                .map_err(|e| AppError::RenderError(format!("Failed to read page content: {e}")))?;

            // Drain whatever the listener buffered during the load; stop
            // as soon as the stream goes quiet.
            let mut network_requests = Vec::new();
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(200), events.next()).await
            {
                network_requests.push(NetworkRequest {
                    method: event.request.method.clone(),
                    url: event.request.url.clone(),
                    resource_type: resource_type_label(event.r#type.as_ref()),
                });
            }

            // Close the tab to free browser resources.
            let _ = page.close().await;

            Ok::<RenderedPage, AppError>(RenderedPage {
                html,
                network_requests,
            })
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::RenderError(format!(
                "Render of {url} timed out after {} seconds",
                timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_labels() {
        assert_eq!(resource_type_label(Some(&ResourceType::Xhr)), "XHR");
        assert_eq!(resource_type_label(Some(&ResourceType::Fetch)), "Fetch");
        assert_eq!(resource_type_label(Some(&ResourceType::Document)), "Document");
        assert_eq!(resource_type_label(None), "Other");
    }
}
