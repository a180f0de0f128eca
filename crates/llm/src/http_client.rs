use std::time::Duration;

use axum::http;
use reqwest::Client;

/// Shared client settings for upstream providers.
///
/// No total timeout: streams stay open as long as the provider keeps sending,
/// and the router enforces the request deadline.
pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        // Short idle timeout so DNS changes are picked up by new connections.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}
