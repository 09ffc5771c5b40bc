//! Application availability check

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};

/// Poll `base_url` until it answers with anything but a server error.
///
/// Redirects and 4xx responses count as up: the landing pages of the
/// application under test redirect or require a token.
pub async fn wait_for_app(base_url: &str, ignore_https_errors: bool, timeout: Duration) -> E2eResult<()> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(ignore_https_errors)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(2))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0;

    while attempts == 0 || start.elapsed() < timeout {
        attempts += 1;

        match client.get(base_url).send().await {
            Ok(resp) if !resp.status().is_server_error() => {
                info!("Application is up at {} ({})", base_url, resp.status());
                return Ok(());
            }
            Ok(resp) => {
                warn!("Health check returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for application at {}...", base_url);
                }
                // Connection refused is expected while the app is starting
                if !e.is_connect() {
                    warn!("Health check error: {}", e);
                }
            }
        }

        sleep(Duration::from_millis(500)).await;
    }

    Err(E2eError::AppUnavailable {
        url: base_url.to_string(),
        attempts,
    })
}

/// [`wait_for_app`] using the configured base URL and TLS policy
pub async fn wait_for_configured_app(config: &HarnessConfig, timeout: Duration) -> E2eResult<()> {
    wait_for_app(&config.base_url, config.ignore_https_errors, timeout).await
}
