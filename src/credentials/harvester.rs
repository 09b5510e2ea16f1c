//! Headless-browser credential harvester.
//!
//! Drives a Chromium session against the vendor's login surface: fill the
//! account form, submit, then watch the outbound requests the authenticated
//! page issues and lift the bearer token (and account identifier) from the
//! query parameters of its fleet-data request. The vendor exposes no other
//! way to mint a token.
//!
//! Every exit path — success, element timeout, token never observed — closes
//! the browser process. On failure a diagnostic screenshot is saved before
//! teardown.

use super::{AcquisitionError, CredentialHarvester, HarvestedCredential};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded wait for login-page elements and navigation.
const ELEMENT_WAIT: Duration = Duration::from_secs(15);
/// Poll interval while waiting for an element to appear.
const ELEMENT_POLL: Duration = Duration::from_millis(250);
/// Fixed idle delay after login so the vendor backend warms up before the
/// page starts issuing authenticated requests.
const WARMUP_DELAY: Duration = Duration::from_secs(5);
/// Deadline for observing the token-bearing request after login.
const TOKEN_WAIT: Duration = Duration::from_secs(30);

/// CSS selectors tried for the login form, broad enough to survive vendor
/// markup changes.
const USERNAME_SELECTOR: &str =
    "input[name=email], input[name=username], input[type=email], input#email";
const PASSWORD_SELECTOR: &str = "input[name=password], input[type=password], input#password";
const SUBMIT_SELECTOR: &str = "button[type=submit], input[type=submit], button#login";

/// Query-parameter names the vendor has used for the bearer token.
const TOKEN_PARAMS: &[&str] = &["token", "user_api_hash", "key"];
/// Query-parameter names for the account identifier.
const ACCOUNT_PARAMS: &[&str] = &["account_id", "user_id", "account"];

impl From<CdpError> for AcquisitionError {
    fn from(err: CdpError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Production [`CredentialHarvester`] backed by a headless Chromium process.
pub struct BrowserHarvester {
    login_url: String,
    account_id: String,
    secret: String,
    /// URL substring identifying the request that carries the token.
    data_request_marker: String,
    screenshot_dir: PathBuf,
}

impl BrowserHarvester {
    pub fn new(
        login_url: &str,
        account_id: &str,
        secret: &str,
        data_request_marker: &str,
        screenshot_dir: PathBuf,
    ) -> Self {
        Self {
            login_url: login_url.to_string(),
            account_id: account_id.to_string(),
            secret: secret.to_string(),
            data_request_marker: data_request_marker.to_string(),
            screenshot_dir,
        }
    }

    async fn drive_login(&self, page: &Page) -> Result<HarvestedCredential, AcquisitionError> {
        // Register the request listener before touching the form so no
        // outbound request slips past between submit and observation.
        let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;

        tokio::time::timeout(ELEMENT_WAIT, page.wait_for_navigation())
            .await
            .map_err(|_| AcquisitionError::NavigationTimeout)??;

        self.find_with_wait(page, USERNAME_SELECTOR, "username field")
            .await?
            .click()
            .await?
            .type_str(&self.account_id)
            .await?;

        self.find_with_wait(page, PASSWORD_SELECTOR, "password field")
            .await?
            .click()
            .await?
            .type_str(&self.secret)
            .await?;

        self.find_with_wait(page, SUBMIT_SELECTOR, "submit button")
            .await?
            .click()
            .await?;

        debug!(delay_secs = WARMUP_DELAY.as_secs(), "Login submitted, waiting for vendor warm-up");
        tokio::time::sleep(WARMUP_DELAY).await;

        // Watch outbound requests until the fleet-data request shows up with
        // a token, or the deadline passes. Events fired during the warm-up
        // delay are buffered by the listener, so nothing is missed.
        let deadline = tokio::time::Instant::now() + TOKEN_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AcquisitionError::TokenNotObserved);
            }
            match tokio::time::timeout(remaining, requests.next()).await {
                Ok(Some(event)) => {
                    if let Some(credential) = self.extract_credential(&event.request.url) {
                        return Ok(credential);
                    }
                }
                // Listener closed or deadline hit without a matching request.
                Ok(None) | Err(_) => return Err(AcquisitionError::TokenNotObserved),
            }
        }
    }

    /// Poll for an element until it appears or the bounded wait elapses.
    async fn find_with_wait(
        &self,
        page: &Page,
        selector: &str,
        what: &'static str,
    ) -> Result<chromiumoxide::Element, AcquisitionError> {
        let deadline = tokio::time::Instant::now() + ELEMENT_WAIT;
        loop {
            match page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(ELEMENT_POLL).await;
                }
                Err(_) => return Err(AcquisitionError::ElementNotFound(what)),
            }
        }
    }

    /// Pull token + account id out of a fleet-data request URL's query
    /// parameters. Returns `None` for unrelated requests.
    fn extract_credential(&self, url: &str) -> Option<HarvestedCredential> {
        if !url.contains(&self.data_request_marker) {
            return None;
        }
        let query = url.split_once('?')?.1;

        let mut token = None;
        let mut account = None;
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if TOKEN_PARAMS.contains(&key) {
                token = Some(value.to_string());
            } else if ACCOUNT_PARAMS.contains(&key) {
                account = Some(value.to_string());
            }
        }

        token.map(|token| HarvestedCredential {
            token,
            // Some vendor builds omit the account parameter; the login
            // account is the same identity.
            account_id: account.unwrap_or_else(|| self.account_id.clone()),
        })
    }

    async fn capture_failure_screenshot(&self, page: &Page) {
        if let Err(e) = std::fs::create_dir_all(&self.screenshot_dir) {
            warn!(error = %e, dir = %self.screenshot_dir.display(), "Could not create screenshot dir");
            return;
        }
        let path = self.screenshot_dir.join(format!(
            "login-failure-{}.png",
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        match page.save_screenshot(params, &path).await {
            Ok(_) => info!(path = %path.display(), "Saved login-failure screenshot"),
            Err(e) => warn!(error = %e, "Failed to capture login-failure screenshot"),
        }
    }
}

#[async_trait]
impl CredentialHarvester for BrowserHarvester {
    async fn harvest(&self) -> Result<HarvestedCredential, AcquisitionError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(AcquisitionError::Launch)?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AcquisitionError::Launch(e.to_string()))?;

        // The handler must be polled for the browser connection to make
        // progress; it runs until the browser closes.
        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = match browser.new_page(self.login_url.as_str()).await {
            Ok(page) => {
                let result = self.drive_login(&page).await;
                if result.is_err() {
                    self.capture_failure_screenshot(&page).await;
                }
                result
            }
            Err(e) => Err(AcquisitionError::Protocol(e.to_string())),
        };

        // Teardown on every path; a leaked Chromium process would pile up
        // across 3-minute cycles.
        if let Err(e) = browser.close().await {
            warn!(error = %e, "Browser close failed");
        }
        let _ = browser.wait().await;
        driver.abort();

        match &result {
            Ok(credential) => {
                info!(account = %credential.account_id, "Credential harvested from vendor console");
            }
            Err(e) => warn!(error = %e, "Credential harvesting failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harvester() -> BrowserHarvester {
        BrowserHarvester::new(
            "https://gps.example/login",
            "acct-7",
            "secret",
            "get_devices",
            PathBuf::from("/tmp/oracle-shots"),
        )
    }

    #[test]
    fn extracts_token_and_account_from_marked_request() {
        let credential = harvester()
            .extract_credential(
                "https://gps.example/api/get_devices?user_api_hash=abc123&user_id=991&lang=en",
            )
            .unwrap();
        assert_eq!(credential.token, "abc123");
        assert_eq!(credential.account_id, "991");
    }

    #[test]
    fn ignores_unrelated_requests() {
        assert!(harvester()
            .extract_credential("https://gps.example/assets/logo.png?v=2")
            .is_none());
        // Marked request without a token parameter is not a credential.
        assert!(harvester()
            .extract_credential("https://gps.example/api/get_devices?lang=en")
            .is_none());
    }

    #[test]
    fn falls_back_to_login_account_when_param_missing() {
        let credential = harvester()
            .extract_credential("https://gps.example/api/get_devices?token=tok55")
            .unwrap();
        assert_eq!(credential.token, "tok55");
        assert_eq!(credential.account_id, "acct-7");
    }
}
