//! End-to-end CLI tests driving the real `forge-pipeline` binary against
//! fake external collaborators substituted via `PIPELINE_*_CMD`.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn forge_pipeline() -> Command {
    Command::cargo_bin("forge-pipeline").unwrap()
}

fn write_prd(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("prd.md");
    fs::write(&path, "# Sample PRD\n\nBuild auth, order, billing services.").unwrap();
    path
}

/// Writes a fake Architect binary: a tiny shell script that copies a
/// fixture SQLite database to whatever `--output` it's given.
fn fake_architect_script(dir: &Path, services: &[(&str, &str)]) -> std::path::PathBuf {
    let db_path = dir.join("architect_fixture.db");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch("CREATE TABLE services (service_name TEXT, description TEXT, dependencies TEXT, extra TEXT); CREATE TABLE domain_entities (name TEXT, service_name TEXT, fields TEXT);")
        .unwrap();
    for (name, deps_json) in services {
        conn.execute(
            "INSERT INTO services (service_name, description, dependencies, extra) VALUES (?1, ?2, ?3, '{}')",
            rusqlite::params![name, format!("{name} service"), deps_json],
        )
        .unwrap();
    }

    let script_path = dir.join("fake_architect.sh");
    fs::write(
        &script_path,
        format!(
            "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  case \"$1\" in\n    --output) shift; cp '{}' \"$1\" ;;\n  esac\n  shift\ndone\n",
            db_path.display()
        ),
    )
    .unwrap();
    set_executable(&script_path);
    script_path
}

fn fake_passthrough_script(dir: &Path, name: &str) -> std::path::PathBuf {
    let script_path = dir.join(format!("fake_{name}.sh"));
    fs::write(
        &script_path,
        "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  case \"$1\" in\n    --output) shift; echo '{}' > \"$1\" ;;\n  esac\n  shift\ndone\n",
    )
    .unwrap();
    set_executable(&script_path);
    script_path
}

fn fake_builder_script(dir: &Path) -> std::path::PathBuf {
    let script_path = dir.join("fake_builder.sh");
    fs::write(
        &script_path,
        "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  case \"$1\" in\n    --output) shift; mkdir -p \"$(dirname \"$1\")\"; echo 'fn main() {}' > \"$1\" ;;\n  esac\n  shift\ndone\n",
    )
    .unwrap();
    set_executable(&script_path);
    script_path
}

#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) {}

mod init_and_status {
    use super::*;

    #[test]
    fn init_creates_state_and_metadata() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());

        forge_pipeline()
            .current_dir(dir.path())
            .arg("init")
            .arg(&prd)
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));

        assert!(dir.path().join("forge-run/RUN_METADATA.json").exists());
        assert!(dir.path().join("forge-run/PIPELINE_STATE.json").exists());
    }

    #[test]
    fn status_reports_initialized_phase() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());

        forge_pipeline().current_dir(dir.path()).arg("init").arg(&prd).assert().success();

        forge_pipeline()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
    }

    #[test]
    fn status_without_init_is_a_user_error() {
        let dir = TempDir::new().unwrap();

        forge_pipeline().current_dir(dir.path()).arg("status").assert().failure().code(1);
    }

    #[test]
    fn init_rejects_missing_prd() {
        let dir = TempDir::new().unwrap();

        forge_pipeline()
            .current_dir(dir.path())
            .arg("init")
            .arg(dir.path().join("nope.md"))
            .assert()
            .failure()
            .code(1);
    }
}

mod config_template {
    use super::*;

    #[test]
    fn config_template_mentions_every_top_level_section() {
        forge_pipeline()
            .arg("config-template")
            .assert()
            .success()
            .stdout(predicate::str::contains("architect:"))
            .stdout(predicate::str::contains("builder:"))
            .stdout(predicate::str::contains("quality_gate:"))
            .stdout(predicate::str::contains("graph_rag:"))
            .stdout(predicate::str::contains("budget_limit:"));
    }
}

mod full_run {
    use super::*;

    #[test]
    fn three_service_happy_path_reaches_done_success() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());
        let architect = fake_architect_script(dir.path(), &[("auth", "[]"), ("order", "[\"auth\"]"), ("billing", "[\"order\"]")]);
        let integration = fake_passthrough_script(dir.path(), "integrate");
        let builder = fake_builder_script(dir.path());

        forge_pipeline()
            .current_dir(dir.path())
            .env("PIPELINE_ARCHITECT_CMD", architect.display().to_string())
            .env("PIPELINE_INTEGRATION_CMD", integration.display().to_string())
            .env("PIPELINE_BUILDER_CMD", builder.display().to_string())
            .env("PIPELINE_GRAPH_RAG_ENABLED", "false")
            .arg("run")
            .arg(&prd)
            .assert()
            .success()
            .stdout(predicate::str::contains("done_success"));
    }

    #[test]
    fn budget_exceeded_mid_build_fails_with_exit_code_two() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());
        let architect = fake_architect_script(dir.path(), &[("auth", "[]")]);
        let builder = fake_builder_script(dir.path());

        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(dir.path().join(".forge/pipeline.toml"), "budget_limit = \"0.01\"\n").unwrap();

        forge_pipeline()
            .current_dir(dir.path())
            .env("PIPELINE_ARCHITECT_CMD", architect.display().to_string())
            .env("PIPELINE_BUILDER_CMD", builder.display().to_string())
            .env("PIPELINE_GRAPH_RAG_ENABLED", "false")
            .arg("run")
            .arg(&prd)
            .assert()
            .failure()
            .code(2);
    }

    #[test]
    fn empty_service_map_goes_straight_to_done_success() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());
        let architect = fake_architect_script(dir.path(), &[]);

        forge_pipeline()
            .current_dir(dir.path())
            .env("PIPELINE_ARCHITECT_CMD", architect.display().to_string())
            .env("PIPELINE_GRAPH_RAG_ENABLED", "false")
            .arg("run")
            .arg(&prd)
            .assert()
            .success()
            .stdout(predicate::str::contains("done_success"));
    }

    #[test]
    fn resume_continues_a_seeded_run_from_quality_gating() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());

        forge_pipeline().current_dir(dir.path()).arg("init").arg(&prd).assert().success();

        let run_dir = dir.path().join("forge-run");
        let state_path = run_dir.join("PIPELINE_STATE.json");
        let mut state: serde_json::Value = serde_json::from_str(&fs::read_to_string(&state_path).unwrap()).unwrap();
        state["phase"] = serde_json::json!("quality_gating");
        state["builder_results"] = serde_json::json!({});
        fs::write(&state_path, serde_json::to_string_pretty(&state).unwrap()).unwrap();

        forge_pipeline()
            .current_dir(dir.path())
            .env("PIPELINE_GRAPH_RAG_ENABLED", "false")
            .arg("resume")
            .assert()
            .success()
            .stdout(predicate::str::contains("done_success"));
    }

    #[test]
    fn plan_stops_before_the_builder_fleet() {
        let dir = TempDir::new().unwrap();
        let prd = write_prd(dir.path());
        let architect = fake_architect_script(dir.path(), &[("auth", "[]")]);

        forge_pipeline().current_dir(dir.path()).arg("init").arg(&prd).assert().success();

        forge_pipeline()
            .current_dir(dir.path())
            .env("PIPELINE_ARCHITECT_CMD", architect.display().to_string())
            .env("PIPELINE_GRAPH_RAG_ENABLED", "false")
            .arg("plan")
            .assert()
            .success()
            .stdout(predicate::str::contains("graph_rag_ready"));

        let state: serde_json::Value = serde_json::from_str(&fs::read_to_string(dir.path().join("forge-run/PIPELINE_STATE.json")).unwrap()).unwrap();
        assert_eq!(state["phase"], "graph_rag_ready");
    }
}
