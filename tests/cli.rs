use rusqlite::Connection;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

const CONSUMPTION_ID: &str = "thames_water:thameswater_consumption";

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_water-meter")
}

fn run_cmd_with_env(home: &TempDir, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(bin_path());
    cmd.args(args)
        .env("WATER_METER_HOME", home.path())
        .env_remove("WATER_METER_PASSWORD")
        .env_remove("WATER_METER_EMAIL")
        .env_remove("WATER_METER_ACCOUNT_NUMBER")
        .env_remove("WATER_METER_METER_ID");
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().expect("run water-meter command")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    run_cmd_with_env(home, args, &[])
}

fn config_path(home: &TempDir) -> PathBuf {
    home.path().join("config").join("config.toml")
}

fn db_path(home: &TempDir) -> PathBuf {
    home.path().join("data").join("statistics.sqlite")
}

fn seed_consumption(home: &TempDir, rows: &[(&str, f64, f64)]) {
    let conn = Connection::open(db_path(home)).expect("open sqlite");
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS statistics_meta (
            statistic_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            unit TEXT NOT NULL,
            has_mean INTEGER NOT NULL,
            has_sum INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS statistics (
            statistic_id TEXT NOT NULL,
            start TEXT NOT NULL,
            state REAL NOT NULL,
            sum REAL NOT NULL,
            PRIMARY KEY (statistic_id, start)
        );
        "#,
    )
    .expect("create statistics tables");

    conn.execute(
        "INSERT INTO statistics_meta (statistic_id, source, name, unit, has_mean, has_sum)
         VALUES (?1, 'thames_water', 'Thames Water Consumption', 'L', 0, 1)",
        [CONSUMPTION_ID],
    )
    .expect("insert metadata");

    for (start, state, sum) in rows {
        conn.execute(
            "INSERT INTO statistics (statistic_id, start, state, sum) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![CONSUMPTION_ID, start, state, sum],
        )
        .expect("insert statistic row");
    }
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(config_path(&home).exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(config_path(&home)).expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(config_path(&home)).expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn refresh_without_configuration_fails_before_login() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["refresh"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("email is not configured"));
    assert!(!stderr.contains("portal authentication"));
}

#[test]
fn refresh_names_missing_meter_id() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    fs::write(
        config_path(&home),
        "email = \"user@example.com\"\naccount_number = \"900012345678\"\n",
    )
    .expect("write config");

    let output = run_cmd_with_env(&home, &["refresh"], &[("WATER_METER_PASSWORD", "pw")]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("meter_id is not configured"));
}

#[test]
fn configure_writes_config_without_password() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &[
            "configure",
            "--email",
            "user@example.com",
            "--account-number",
            "900012345678",
            "--meter-id",
            "123456",
            "--liter-cost",
            "0.0035",
            "--fetch-hours",
            "6,18",
        ],
    );
    assert!(output.status.success());

    let raw = fs::read_to_string(config_path(&home)).expect("read config");
    assert!(raw.contains("meter_id = \"123456\""));
    assert!(raw.contains("fetch_hours = \"6,18\""));
    assert!(raw.contains("0.0035"));
    assert!(!raw.contains("password"));

    let refresh = run_cmd(&home, &["refresh"]);
    assert!(!refresh.status.success());
    assert!(String::from_utf8_lossy(&refresh.stderr).contains("password is not configured"));
}

#[test]
fn configure_rejects_invalid_fetch_hours() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &[
            "configure",
            "--email",
            "user@example.com",
            "--account-number",
            "900012345678",
            "--meter-id",
            "123456",
            "--fetch-hours",
            "noon",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid fetch_hours"));
}

#[test]
fn export_json_outputs_metadata_and_points() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_consumption(
        &home,
        &[
            ("2024-03-17T02:00:00Z", 5.0, 115.0),
            ("2024-03-17T01:00:00Z", 10.0, 110.0),
        ],
    );

    let output = run_cmd(&home, &["export", "--format", "json"]);
    assert!(output.status.success());

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    assert_eq!(parsed["metadata"]["series_id"], CONSUMPTION_ID);
    assert_eq!(parsed["metadata"]["unit"], "L");
    let points = parsed["points"].as_array().expect("points array");
    assert_eq!(points.len(), 2);
    assert_eq!(points[0]["cumulative_sum"], 110.0);
    assert_eq!(points[1]["cumulative_sum"], 115.0);
}

#[test]
fn export_csv_outputs_header_and_rows() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_consumption(&home, &[("2024-03-17T01:00:00Z", 10.0, 110.0)]);

    let output = run_cmd(&home, &["export", "--format", "csv"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "hour_start,value,cumulative_sum");
    assert_eq!(lines[1], "2024-03-17T01:00:00+00:00,10,110");
}

#[test]
fn export_of_empty_cost_series_is_empty() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["export", "--series", "cost"]);
    assert!(output.status.success());
    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    assert!(parsed["metadata"].is_null());
    assert_eq!(parsed["points"].as_array().map(Vec::len), Some(0));
}

#[test]
fn export_rejects_unknown_series() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["export", "--series", "gas"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unsupported series"));
}
