//! CLI command integration tests.
//! Each test uses a temp directory via PC_DATA_DIR for full isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pc_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("pc").unwrap();
    cmd.env("PC_DATA_DIR", data_dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

fn extract_stat_value(output: &str, prefix: &str) -> String {
    output
        .lines()
        .find(|l| l.starts_with(prefix))
        .unwrap_or_else(|| panic!("stat line starting with '{prefix}' not found in output:\n{output}"))
        .split_whitespace()
        .last()
        .unwrap()
        .to_string()
}

#[test]
fn stats_fresh_session() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["stats", "--session", "fresh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("session:        fresh"))
        .stdout(predicate::str::contains("facts:          0"))
        .stdout(predicate::str::contains("logged cycles:  0"));
}

#[test]
fn ask_contradiction_fires_counterexample() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["ask", "is(system, secure); not is(system, secure)"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[counterexample]"))
        .stdout(predicate::str::contains("is(system, secure)"));
}

#[test]
fn state_persists_between_invocations() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["ask", "likes(ann, tea)"])
        .assert()
        .success();
    pc_cmd(&dir)
        .args(["ask", "not likes(ann, tea)"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[counterexample]"));

    let output = pc_cmd(&dir).arg("stats").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "cycle:"), "2");
    assert_eq!(extract_stat_value(&stdout, "facts:"), "2");
    assert_eq!(extract_stat_value(&stdout, "contradictions:"), "1");
    assert_eq!(extract_stat_value(&stdout, "logged cycles:"), "2");
}

#[test]
fn run_reads_stdin_lines() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .arg("run")
        .write_stdin("likes(ann, tea)\n\nwho is zaphod?\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("[clarify] Recorded 1 fact(s)."))
        .stdout(predicate::str::contains("zaphod"));

    pc_cmd(&dir)
        .args(["history", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#0 "))
        .stdout(predicate::str::contains("#1 "))
        .stdout(predicate::str::contains("who is zaphod?"));
}

#[test]
fn empty_input_clarifies() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["ask", "   "])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[clarify]"));
}

#[test]
fn json_response_shape() {
    let dir = TempDir::new().unwrap();
    let output = pc_cmd(&dir)
        .args(["ask", "--json", "is(a, b); not is(a, b)"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["action"], "counterexample");
    assert_eq!(value["cycle"], 0);
    assert!(value["signals"]["contradiction"].as_f64().unwrap() > 0.3);
}

#[test]
fn search_uses_corpus() {
    let dir = TempDir::new().unwrap();
    let corpus = dir.path().join("corpus");
    std::fs::create_dir(&corpus).unwrap();
    std::fs::write(
        corpus.join("games.txt"),
        "Zork was written at MIT in the late 1970s.\n\nIt is a text adventure.",
    )
    .unwrap();

    pc_cmd(&dir)
        .args(["ask", "search zork history"])
        .arg("--corpus")
        .arg(&corpus)
        .assert()
        .success()
        .stdout(predicate::str::contains("[continue]"))
        .stdout(predicate::str::contains("retrieved 1 result(s)"));
}

#[test]
fn missing_retriever_becomes_gap() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["ask", "search zork history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded as a gap"));

    let output = pc_cmd(&dir).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "gaps:"), "1");
}

#[test]
fn evolve_reports_steps() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["evolve", "--steps", "25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("steps:      25/25"))
        .stdout(predicate::str::contains("cancelled:  false"))
        .stdout(predicate::str::contains("diverged:   no"));
}

#[test]
fn evolve_rejects_bad_dt() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["evolve", "--steps", "5", "--dt=-0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--dt"));
}

#[test]
fn evolve_rejects_unstable_dt_and_session_survives() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir).args(["ask", "is(a, b)"]).assert().success();
    pc_cmd(&dir)
        .args(["evolve", "--steps", "50", "--dt", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("stable step limit"));

    pc_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("facts:          1"));
    pc_cmd(&dir).arg("history").assert().success();
}

#[test]
fn config_prints_effective_toml() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("tau_F = 0.3"))
        .stdout(predicate::str::contains("cooldown_window = 3"))
        .stdout(predicate::str::contains("[field]"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.toml"), "tau_F = 0.45\n").unwrap();
    pc_cmd(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("tau_F = 0.45"));
}

#[test]
fn unstable_config_fails_loudly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("unstable.toml");
    std::fs::write(&path, "[field]\ngamma = 1.0\n").unwrap();
    pc_cmd(&dir)
        .args(["ask", "is(a, b)", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("gamma"));
}

#[test]
fn reset_clears_state_but_keeps_log() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir).args(["ask", "is(a, b)"]).assert().success();
    pc_cmd(&dir)
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("reset session 'default'"));

    let output = pc_cmd(&dir).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "facts:"), "0");
    assert_eq!(extract_stat_value(&stdout, "logged cycles:"), "1");
}

#[test]
fn sessions_are_isolated() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir)
        .args(["ask", "--session", "one", "is(a, b)"])
        .assert()
        .success();

    let output = pc_cmd(&dir)
        .args(["stats", "--session", "two"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "facts:"), "0");
}

#[test]
fn missing_required_args() {
    let dir = TempDir::new().unwrap();
    pc_cmd(&dir).arg("ask").assert().failure();
    pc_cmd(&dir).assert().failure();
}
