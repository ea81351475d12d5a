//! Polling watcher for the configuration file.
//!
//! The initial load is synchronous and fatal on error. After that a
//! background task polls the file's modification time (default every 5 s)
//! and publishes a fresh snapshot when it changes. Any reload failure is
//! logged, counted, and leaves the previous snapshot serving traffic.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use common::configuration::{ConfigError, FilterConfig};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SnapshotError;
use crate::metrics::Metrics;
use crate::server::ExtProcService;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Load the configuration once, then keep watching it in the background.
pub fn start_config_watcher(
    path: PathBuf,
    service: ExtProcService,
    interval: Duration,
) -> Result<(), WatcherError> {
    load_and_publish(&path, &service)?;
    let mut last_modified = modified_time(&path);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let modified = modified_time(&path);
            if modified == last_modified {
                continue;
            }
            last_modified = modified;
            match load_and_publish(&path, &service) {
                Ok(generation) => {
                    info!(generation, path = %path.display(), "configuration reloaded");
                }
                Err(e) => {
                    Metrics::get_or_create().config_reload_failures.inc();
                    warn!(error = %e, path = %path.display(), "configuration reload failed, keeping previous snapshot");
                }
            }
        }
    });
    Ok(())
}

fn load_and_publish(path: &PathBuf, service: &ExtProcService) -> Result<u64, WatcherError> {
    let contents = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    let config = FilterConfig::from_yaml(&contents)?;
    Ok(service.update_config(config)?)
}

fn modified_time(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
inputSchema: {name: OpenAI, version: v1}
declaredModels: [gpt-4o]
"#;

    fn write_config(path: &std::path::Path, contents: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn initial_load_publishes_first_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_config(&path, VALID);

        let service = ExtProcService::new();
        start_config_watcher(path, service.clone(), Duration::from_secs(3600)).unwrap();
        let state = service.state();
        assert_eq!(state.generation(), 1);
        assert_eq!(state.snapshot().unwrap().declared_models, vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn initial_load_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_config(&path, "inputSchema: [not, a, mapping]");

        let service = ExtProcService::new();
        let err = start_config_watcher(path, service, Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, WatcherError::Config(ConfigError::Parse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_rewrite_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_config(&path, VALID);

        let service = ExtProcService::new();
        start_config_watcher(path.clone(), service.clone(), Duration::from_millis(10)).unwrap();
        let state = service.state();
        let before = state.snapshot().unwrap();

        // Invalid CEL: parses as YAML, fails snapshot compilation.
        write_config(
            &path,
            r#"
inputSchema: {name: OpenAI, version: v1}
requestCosts:
  - metadataKey: cost
    type: CEL
    cel: "input_tokens +"
"#,
        );
        filetime_bump(&path);
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(state.generation(), 1);
        assert!(std::sync::Arc::ptr_eq(&state.snapshot().unwrap(), &before));
    }

    #[tokio::test(start_paused = true)]
    async fn valid_rewrite_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_config(&path, VALID);

        let service = ExtProcService::new();
        start_config_watcher(path.clone(), service.clone(), Duration::from_millis(10)).unwrap();
        let state = service.state();

        write_config(
            &path,
            r#"
inputSchema: {name: OpenAI, version: v1}
declaredModels: [gpt-4o, gpt-4o-mini]
"#,
        );
        filetime_bump(&path);
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
            if state.generation() == 2 {
                break;
            }
        }

        assert_eq!(state.generation(), 2);
        assert_eq!(state.snapshot().unwrap().declared_models.len(), 2);
    }

    /// Coarse mtime filesystems can miss a same-instant rewrite; force a
    /// distinct timestamp.
    fn filetime_bump(path: &std::path::Path) {
        let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        let _ = file.set_modified(SystemTime::now() + Duration::from_secs(2));
    }
}
