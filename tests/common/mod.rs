//! Common test utilities for issue-courier integration tests

#[allow(dead_code)]
pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::*;

use chrono::NaiveDate;
use issue_courier::config::{PersistenceConfig, RetryConfig};
use issue_courier::pipeline::Collaborators;
use issue_courier::worker::JobOutcome;
use issue_courier::{Config, Courier, JobId, SeriesConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A courier over a throwaway directory, plus the fakes it talks to
pub struct Harness {
    pub courier: Courier,
    pub source: Arc<FakeSource>,
    pub transport: Arc<FakeTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<FakeObjectStore>,
    pub dir: TempDir,
}

/// Test configuration: fast retries, short in-flight check, no periodic triggers
#[allow(dead_code)]
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config {
        persistence: PersistenceConfig {
            database_path: dir.path().join("courier.db"),
        },
        retry: RetryConfig {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        },
        series: vec![
            SeriesConfig::named("weekly"),
            SeriesConfig {
                name: "monthly".to_string(),
                title_pattern: Some(r"\bmonthly\b".to_string()),
            },
        ],
        ..Config::default()
    };
    config.download.download_dir = dir.path().join("downloads");
    config.download.in_flight_check_interval = Duration::from_millis(50);
    config.schedule.enabled = false;
    config
}

#[allow(dead_code)]
pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);

    let source = Arc::new(FakeSource::default());
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(FakeObjectStore::default());
    let collaborators = Collaborators {
        source: source.clone(),
        transport: transport.clone(),
        notifier: notifier.clone(),
        object_store: Some(store.clone()),
    };

    let courier = Courier::new(config, collaborators).await.unwrap();
    Harness {
        courier,
        source,
        transport,
        notifier,
        store,
        dir,
    }
}

/// Run due jobs one by one until the queue is idle
#[allow(dead_code)]
pub async fn drain(courier: &Courier) -> Vec<(JobId, JobOutcome)> {
    let mut outcomes = Vec::new();
    for _ in 0..200 {
        match courier.worker().run_once().await.unwrap() {
            Some(outcome) => outcomes.push(outcome),
            None => return outcomes,
        }
    }
    panic!("queue did not drain: {outcomes:?}");
}

#[allow(dead_code)]
pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
