//! Integration test for the node's log subscriber
//!
//! Lives in its own binary since it installs the global subscriber.

use std::time::Duration;

use tempfile::TempDir;

use node::logging::{init_logging, LOG_FILE_NAME};
use node::NodeConfig;

#[tokio::test]
async fn test_logs_land_in_the_log_dir() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let log_dir = temp.path().join("logs");
    let config = NodeConfig {
        log_level: "debug".to_string(),
        log_dir: Some(log_dir.clone()),
        ..Default::default()
    };

    let guards = init_logging(&config)?;
    assert_eq!(guards.len(), 2);
    assert!(init_logging(&config).is_err());

    tracing::info!("written by the node");
    let panicked = std::panic::catch_unwind(|| panic!("worker blew up"));
    assert!(panicked.is_err());
    let _ = std::panic::take_hook();

    // flushes the non-blocking writers
    drop(guards);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut contents = String::new();
    for entry in std::fs::read_dir(&log_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(LOG_FILE_NAME) {
            contents.push_str(&std::fs::read_to_string(entry.path())?);
        }
    }
    assert!(contents.contains("node logging initialized"));
    assert!(contents.contains("written by the node"));
    assert!(contents.contains("worker blew up"));
    Ok(())
}
