//! # issue-courier
//!
//! Durable job pipeline that discovers periodical issues, downloads their files, and
//! distributes them to subscribers.
//!
//! ## Design Philosophy
//!
//! issue-courier is designed to be:
//! - **Durable** - Jobs, attempts, and outcomes live in SQLite and survive restarts
//! - **Idempotent** - Every stage finds already-done work and returns without side effects
//! - **Library-first** - No CLI or UI; sources, transport, and delivery are plugged in
//! - **Observable** - Every job attempt is recorded in a queryable task ledger
//!
//! ## Pipeline
//!
//! ```text
//! Scheduler ─▶ Discover ─▶ FetchDetail ─▶ Download ─▶ Distribute
//!                 │                          │             │
//!                 └── items ──── links ──────┴─────────────┘
//! ```
//!
//! Stages talk only through the store. Discover and FetchDetail enqueue the next stage
//! after their own writes commit; downloaded items reach Compress and Distribute through
//! the scheduler's sweeps.
//!
//! ## Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use issue_courier::collaborators::SourceConnector;
//! use issue_courier::db::{Item, ItemDraft};
//! use issue_courier::notifier::{WebhookConfig, WebhookNotifier};
//! use issue_courier::pipeline::Collaborators;
//! use issue_courier::transport::HttpTransport;
//! use issue_courier::{Config, Courier, run_with_shutdown};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct MySource;
//!
//! #[async_trait]
//! impl SourceConnector for MySource {
//!     async fn discover(&self, _series: &str, _page: u32) -> issue_courier::Result<Vec<ItemDraft>> {
//!         Ok(Vec::new())
//!     }
//!     async fn resolve(&self, item: &Item) -> issue_courier::Result<String> {
//!         Ok(format!("{}/download", item.detail_ref))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_json_file(std::path::Path::new("courier.json"))?;
//!     let collaborators = Collaborators {
//!         source: Arc::new(MySource),
//!         transport: Arc::new(HttpTransport::new(Duration::from_secs(30), "issue-courier")?),
//!         notifier: Arc::new(WebhookNotifier::new(WebhookConfig {
//!             url: "https://mail.example.com/send".to_string(),
//!             auth_header: None,
//!             timeout_secs: 30,
//!         })?),
//!         object_store: None,
//!     };
//!
//!     let courier = Courier::new(config, collaborators).await?;
//!     courier.start().await;
//!
//!     run_with_shutdown(courier).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// External collaborator interfaces
pub mod collaborators;
/// Configuration types
pub mod config;
/// Top-level facade
pub mod courier;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Task ledger lifecycle hooks
pub mod ledger;
/// Webhook notifier
pub mod notifier;
/// Pipeline stages
pub mod pipeline;
/// Filter/sort/paginate query layer
pub mod query;
/// Durable job queue
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Periodic sweep triggers
pub mod scheduler;
/// Content/subscriber state machine
pub mod state;
/// HTTP transport
pub mod transport;
/// Core identifier and status types
pub mod types;
/// Worker pool
pub mod worker;

// Re-export commonly used types
pub use config::{Config, SeriesConfig};
pub use courier::Courier;
pub use db::Database;
pub use error::{DatabaseError, Error, Result};
pub use query::{Filter, Query, Value};
pub use queue::Job;
pub use types::{ItemId, ItemState, JobId, LinkStatus, SubscriberId, TaskStatus};

/// Run the courier until a termination signal arrives, then shut it down gracefully.
///
/// On unix this is SIGTERM or SIGINT; elsewhere Ctrl+C. If one source cannot be
/// registered the other one still works.
pub async fn run_with_shutdown(courier: Courier) -> Result<()> {
    let signal = wait_for_signal().await;
    tracing::info!(signal, "Shutdown signal received");
    courier.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::pin!(terminate);

    tokio::select! {
        _ = &mut terminate => "SIGTERM",
        interrupted = tokio::signal::ctrl_c() => match interrupted {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::warn!(error = %e, "SIGINT handler unavailable, waiting for SIGTERM");
                (&mut terminate).await;
                "SIGTERM"
            }
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_is_reported_by_name() {
        let waiter = tokio::spawn(wait_for_signal());
        // Let the handler register before the signal is raised
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("signal wait did not finish")
            .unwrap();
        assert_eq!(signal, "SIGTERM");
    }
}
