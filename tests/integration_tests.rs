//! Integration tests for the stagehand CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn stagehand() -> Command {
    cargo_bin_cmd!("stagehand")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    stagehand()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Point every role at a shell worker that reports success with one artifact.
#[cfg(unix)]
fn use_shell_worker(dir: &TempDir) {
    let config = r#"
[scheduler]
max_parallel = 2
unit_timeout_secs = 30

[workers.default]
command = "sh"
args = ["-c", "cat > /dev/null; echo '{\"status\":\"success\",\"artifacts\":[\"out\"]}'"]

[logging]
file = false
"#;
    fs::write(dir.path().join(".stagehand/stagehand.toml"), config).unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        stagehand().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        stagehand().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized stagehand project"));

        assert!(dir.path().join(".stagehand/plan.json").exists());
        assert!(dir.path().join(".stagehand/stagehand.toml").exists());
        assert!(dir.path().join(".stagehand/logs").is_dir());
    }

    #[test]
    fn test_init_twice_keeps_plan() {
        let dir = create_temp_project();
        init_project(&dir);
        let plan_path = dir.path().join(".stagehand/plan.json");
        let before = fs::read_to_string(&plan_path).unwrap();

        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));

        assert_eq!(fs::read_to_string(&plan_path).unwrap(), before);
    }

    #[test]
    fn test_commands_require_init() {
        let dir = create_temp_project();
        stagehand()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("stagehand init"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        stagehand()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();
        assert!(dir.path().join(".stagehand").exists());
    }
}

mod plan_commands {
    use super::*;

    #[test]
    fn test_plan_show_lists_units() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("survey"))
            .stdout(predicate::str::contains("core"))
            .stdout(predicate::str::contains("cli"));
    }

    #[test]
    fn test_plan_validate_sample() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Plan is valid: 2 phases, 3 units"));
    }

    #[test]
    fn test_plan_validate_reports_cycle() {
        let dir = create_temp_project();
        init_project(&dir);
        let plan = r#"{
  "generated_at": "2026-01-01T00:00:00Z",
  "phases": [
    {
      "id": "build",
      "name": "Build",
      "units": [
        {"id": "A", "domain": "core", "depends_on": ["B"], "scopes": ["a"]},
        {"id": "B", "domain": "core", "depends_on": ["A"], "scopes": ["b"]}
      ]
    }
  ]
}"#;
        fs::write(dir.path().join(".stagehand/plan.json"), plan).unwrap();

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn test_plan_waves() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "waves"])
            .assert()
            .success()
            .stdout(predicate::str::contains("wave 0: core"))
            .stdout(predicate::str::contains("wave 1: cli"));
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel = 4"))
            .stdout(predicate::str::contains("max_corrections = 2"));
    }

    #[test]
    fn test_config_validate_warns() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".stagehand/stagehand.toml"),
            "[scheduler]\nmax_parallel = 0\n",
        )
        .unwrap();

        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel is 0"));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }
}

mod status_commands {
    use super::*;

    #[test]
    fn test_status_before_any_run() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Current phase: design"))
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn test_status_json() {
        let dir = create_temp_project();
        init_project(&dir);

        let output = stagehand()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["current_phase"], "design");
        assert_eq!(report["units"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_escalate_is_recorded() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["escalate", "core", "use typed errors"])
            .assert()
            .success()
            .stdout(predicate::str::contains("queued at position 1"));

        stagehand()
            .current_dir(dir.path())
            .args(["ledger", "--entity", "escalation"])
            .assert()
            .success()
            .stdout(predicate::str::contains("submitted"));
    }

    #[test]
    fn test_gate_approve_requires_awaiting_approval() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["gate", "approve", "design"])
            .assert()
            .failure();
    }

    #[test]
    fn test_requeue_unknown_unit() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["requeue", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown unit"));
    }
}

#[cfg(unix)]
mod pipeline_runs {
    use super::*;

    fn run(dir: &TempDir) -> assert_cmd::assert::Assert {
        stagehand()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
    }

    #[test]
    fn test_run_without_workers_fails() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(dir.path().join(".stagehand/stagehand.toml"), "").unwrap();

        stagehand()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No worker"));
    }

    #[test]
    fn test_full_pipeline_through_gates() {
        let dir = create_temp_project();
        init_project(&dir);
        use_shell_worker(&dir);

        run(&dir)
            .success()
            .stdout(predicate::str::contains("✓ survey"))
            .stdout(predicate::str::contains("Phase design awaiting approval"));

        stagehand()
            .current_dir(dir.path())
            .args(["gate", "approve", "design", "-m", "looks good"])
            .assert()
            .success();

        run(&dir)
            .success()
            .stdout(predicate::str::contains("✓ core"))
            .stdout(predicate::str::contains("✓ cli"))
            .stdout(predicate::str::contains("open checklist items: review"));

        stagehand()
            .current_dir(dir.path())
            .args(["gate", "check", "build", "review"])
            .assert()
            .success();

        run(&dir)
            .success()
            .stdout(predicate::str::contains("Phase build awaiting approval"));

        stagehand()
            .current_dir(dir.path())
            .args(["gate", "approve", "build"])
            .assert()
            .success();

        run(&dir)
            .success()
            .stdout(predicate::str::contains("All phases approved"));

        let output = stagehand()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .output()
            .unwrap();
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert!(report["current_phase"].is_null());
        assert!(
            report["units"]
                .as_array()
                .unwrap()
                .iter()
                .all(|u| u["status"] == "verified")
        );
    }

    #[test]
    fn test_rejected_phase_halts_until_resumed() {
        let dir = create_temp_project();
        init_project(&dir);
        use_shell_worker(&dir);

        run(&dir).success();
        stagehand()
            .current_dir(dir.path())
            .args(["--yes", "gate", "reject", "design", "-m", "redo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rejected"));

        run(&dir)
            .failure()
            .stderr(predicate::str::contains("halted"));

        stagehand()
            .current_dir(dir.path())
            .args(["gate", "resume", "design"])
            .assert()
            .success()
            .stdout(predicate::str::contains("resumed"));

        run(&dir)
            .success()
            .stdout(predicate::str::contains("Phase design awaiting approval"));
    }

    #[test]
    fn test_failing_worker_halts_and_requeue_recovers() {
        let dir = create_temp_project();
        init_project(&dir);
        let failing = r#"
[workers.default]
command = "sh"
args = ["-c", "cat > /dev/null; echo '{\"status\":\"failure\",\"findings\":[\"broken\"]}'"]

[logging]
file = false
"#;
        fs::write(dir.path().join(".stagehand/stagehand.toml"), failing).unwrap();

        run(&dir)
            .failure()
            .stdout(predicate::str::contains("✗ survey"));

        stagehand()
            .current_dir(dir.path())
            .args(["status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));

        use_shell_worker(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["requeue", "survey"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Requeued survey"));

        run(&dir)
            .success()
            .stdout(predicate::str::contains("✓ survey"));
    }
}
