//! Tests for the treesync binary and its fixture loader.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;
use tree_sync::ControllerConfig;
use tree_sync_cli::{Fixture, Inspector};

const FIXTURE: &str = r#"{
    "treeId": "review",
    "hasCheckboxes": true,
    "config": { "maxDisplayableChildren": 2 },
    "root": {
        "name": "repo",
        "children": [
            { "name": "src", "children": [
                { "name": "main.rs", "size": 120 },
                { "name": "lib.rs", "size": 80 }
            ] },
            { "name": "assets", "children": [
                { "name": "a.png" }, { "name": "b.png" }, { "name": "c.png" }
            ] }
        ]
    }
}"#;

fn write_fixture(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("tree.json");
    std::fs::write(&path, FIXTURE).unwrap();
    path
}

#[tokio::test]
async fn test_fixture_from_disk_honours_display_cap() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::from_path(&write_fixture(&dir)).unwrap();
    let config = fixture.config.clone().unwrap_or_default();
    assert_eq!(config.max_displayable_children, 2);

    let inspector = Inspector::load(&fixture, config).await.unwrap();
    inspector.expand("assets").await.unwrap();
    let report = inspector.report().await.unwrap();
    assert!(report.view.contains("Too many items to display (3)"));
}

#[tokio::test]
async fn test_checking_directory_selects_uncached_children() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::from_path(&write_fixture(&dir)).unwrap();
    let inspector = Inspector::load(&fixture, ControllerConfig::default()).await.unwrap();

    inspector.check("src").await.unwrap();
    let report = inspector.report().await.unwrap();
    assert_eq!(
        report.checked,
        vec!["/repo/src", "/repo/src/main.rs", "/repo/src/lib.rs"]
    );
}

#[test]
fn test_binary_prints_view_and_checked_rows() {
    let dir = TempDir::new().unwrap();
    let fixture = write_fixture(&dir);

    let output = Command::new(env!("CARGO_BIN_EXE_treesync"))
        .arg("--fixture")
        .arg(&fixture)
        .args(["--expand", "src", "--check", "src/lib.rs"])
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    // Default filter is info, so startup lines reach stderr
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Max displayable children"), "stderr: {}", stderr);

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout,
        "/repo\n  [-] src/\n    [ ] main.rs\n    [x] lib.rs\n  [ ] assets/\n\nChecked (1):\n  /repo/src/lib.rs\n"
    );
}

#[test]
fn test_binary_fails_on_missing_fixture() {
    let dir = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_treesync"))
        .arg("--fixture")
        .arg(dir.path().join("missing.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
}
