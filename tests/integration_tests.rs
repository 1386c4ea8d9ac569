//! Integration tests for the trendsmith CLI
//!
//! These tests exercise commands that need no network or engine.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create a trendsmith Command
fn trendsmith() -> Command {
    cargo_bin_cmd!("trendsmith")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn write_config(dir: &TempDir, content: &str) {
    let config_dir = dir.path().join(".trendsmith");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("trendsmith.toml"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_trendsmith_help() {
        trendsmith()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("analyze"))
            .stdout(predicate::str::contains("probe"));
    }

    #[test]
    fn test_trendsmith_version() {
        trendsmith()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_command_fails() {
        trendsmith().arg("publish").assert().failure();
    }
}

// =============================================================================
// Workflow Analysis Tests
// =============================================================================

mod analyze {
    use super::*;

    #[test]
    fn test_analyze_lists_slots() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .arg("analyze")
            .arg(fixture("tshirt_workflow.py"))
            .assert()
            .success()
            .stdout(predicate::str::contains("text2"))
            .stdout(predicate::str::contains("negative_prompt"))
            .stdout(predicate::str::contains("width4"));
    }

    #[test]
    fn test_analyze_json_output() {
        let dir = create_temp_project();

        let output = trendsmith()
            .current_dir(dir.path())
            .args(["analyze", "--json"])
            .arg(fixture("tshirt_workflow.py"))
            .output()
            .unwrap();
        assert!(output.status.success());

        let slots: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let slots = slots.as_array().unwrap();
        let role_of = |name: &str| {
            slots
                .iter()
                .find(|s| s["name"] == name)
                .map(|s| s["role"].as_str().unwrap().to_string())
        };
        assert_eq!(role_of("text2").as_deref(), Some("prompt"));
        assert_eq!(role_of("text3").as_deref(), Some("negative_prompt"));
        assert_eq!(role_of("height5").as_deref(), Some("height"));
        assert_eq!(role_of("seed6").as_deref(), Some("seed"));
        assert_eq!(role_of("output").as_deref(), Some("output_path"));
    }

    #[test]
    fn test_analyze_save_writes_mapping() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["analyze", "--save"])
            .arg(fixture("tshirt_workflow.py"))
            .assert()
            .success()
            .stdout(predicate::str::contains("Saved slot mapping"));

        let mapping = dir
            .path()
            .join(".trendsmith/workflows/tshirt_workflow.json");
        assert!(mapping.exists());
        let content = fs::read_to_string(mapping).unwrap();
        assert!(content.contains("\"text2\""));
    }

    #[test]
    fn test_analyze_unparsable_script_fails() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .arg("analyze")
            .arg(fixture("broken_workflow.py"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to analyze"));
    }

    #[test]
    fn test_analyze_missing_script_fails() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["analyze", "nope.py"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read workflow script"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("[scan]"))
            .stdout(predicate::str::contains("memes"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created trendsmith.toml"));

        let config_path = dir.path().join(".trendsmith/trendsmith.toml");
        assert!(config_path.exists());
        assert!(dir.path().join(".trendsmith/workflows").is_dir());
        let content = fs::read_to_string(config_path).unwrap();
        assert!(content.contains("[pipeline]"));

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_shows_toml_content() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[scan]
subreddits = ["funny", "wholesomememes"]
min_score = 250
"#,
        );

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("wholesomememes"))
            .stdout(predicate::str::contains("min_score = 250"));
    }

    #[test]
    fn test_config_env_override_shown() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .env("TRENDSMITH_MODEL_ENDPOINT", "http://models.local:9999/v1")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("http://models.local:9999/v1"));
    }

    #[test]
    fn test_config_validate_reports_missing_workflow() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflow script"));
    }

    #[test]
    fn test_config_validate_with_config() {
        let dir = create_temp_project();
        let script = fixture("tshirt_workflow.py");
        write_config(
            &dir,
            &format!(
                r#"
[workflow]
script = {:?}
"#,
                script.display().to_string()
            ),
        );

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_flags_bad_values() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[scan]
subreddits = ["not a subreddit!"]

[engine]
width = 1001
"#,
        );

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalid subreddit name"))
            .stdout(predicate::str::contains("multiple of 8"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = create_temp_project();
        write_config(&dir, "[scan\nsubreddits = ");

        trendsmith()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse trendsmith.toml"));
    }
}

// =============================================================================
// Run Command Tests
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_without_workflow_fails() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to start session"));
    }

    #[test]
    fn test_run_without_sources_fails() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[scan]
subreddits = []
"#,
        );

        trendsmith()
            .current_dir(dir.path())
            .args(["run", "--workflow"])
            .arg(fixture("tshirt_workflow.py"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("no sources configured"));
    }

    #[test]
    fn test_run_with_unparsable_workflow_fails() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["run", "--subreddit", "memes", "--workflow"])
            .arg(fixture("broken_workflow.py"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to start session"));
    }
}

// =============================================================================
// Global Flags Tests
// =============================================================================

mod global_flags {
    use super::*;

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        trendsmith()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["config", "init"])
            .assert()
            .success();

        assert!(dir.path().join(".trendsmith/trendsmith.toml").exists());
    }

    #[test]
    fn test_verbose_flag_accepted() {
        let dir = create_temp_project();

        trendsmith()
            .current_dir(dir.path())
            .args(["--verbose", "config", "validate"])
            .assert()
            .success();
    }
}
