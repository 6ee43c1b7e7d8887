//! HTTP client for the crdata server node.
//!
//! [`ServerApi`](api::ServerApi) claims jobs and fetches their source and
//! parameters. [`StatusReporter`](reporter::StatusReporter) marks jobs done
//! on its own connection pool, separate from the polling client.

pub mod api;
pub mod error;
pub mod reporter;

pub use api::ServerApi;
pub use error::ApiError;
pub use reporter::StatusReporter;

/// Turn a server address as given on the command line into a base URL.
///
/// A bare `host:port` gets `http://`; trailing slashes are dropped.
pub fn normalize_base_url(server: &str) -> String {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
