//! Shared fixtures for the sync tests.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tokio::sync::watch;

use super::Reconciler;
use crate::config::AppConfig;
use crate::model::issue::Issue;
use crate::providers::fake::{FakePlatform, FakeTracker};
use crate::providers::{Platform, Tracker};
use crate::store::IdentityStore;

const CONFIG: &str = r#"
    [jira]
    domain = "acme"
    email = "bot@acme.com"
    api_token = "token"

    [platform]
    base_url = "https://platform.example.com/api"
    api_key = "key"

    [discovery]
    project_keys = ["PROJ"]

    [posting]
    max_attempts = 3
"#;

pub fn config() -> AppConfig {
    let config: AppConfig = toml::from_str(CONFIG).unwrap();
    config.validate().unwrap();
    config
}

/// An open issue in `PROJ`-style projects, updated `minute` minutes into 2019-01-02.
pub fn issue(key: &str, minute: i64) -> Issue {
    let (project, _) = key.split_once('-').unwrap();
    Issue {
        id: format!("1{minute:04}"),
        key: key.to_string(),
        project_key: project.to_string(),
        summary: format!("Work on {key}"),
        status: Some("Open".into()),
        status_category: Some("To Do".into()),
        updated: Utc.with_ymd_and_hms(2019, 1, 2, 0, 0, 0).unwrap() + Duration::minutes(minute),
    }
}

pub struct Harness {
    pub tracker: Arc<FakeTracker>,
    pub platform: Arc<FakePlatform>,
    pub store: IdentityStore,
    pub reconciler: Reconciler,
    pub shutdown: watch::Sender<bool>,
}

pub fn harness(tracker: FakeTracker) -> Harness {
    harness_with(tracker, config())
}

pub fn harness_with(tracker: FakeTracker, config: AppConfig) -> Harness {
    let tracker = Arc::new(tracker.with_user("alice@example.com", "acc-alice", "Alice"));
    let platform = Arc::new(FakePlatform::new());
    let store = IdentityStore::open_in_memory().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        tracker.clone() as Arc<dyn Tracker>,
        platform.clone() as Arc<dyn Platform>,
        store.clone(),
        config,
        shutdown_rx,
    );
    Harness {
        tracker,
        platform,
        store,
        reconciler,
        shutdown,
    }
}
