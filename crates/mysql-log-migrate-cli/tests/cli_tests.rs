//! CLI integration tests for mysql-log-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the mysql-log-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("mysql-log-migrate").unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("load"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_migrate_subcommand_help() {
    cmd()
        .args(["migrate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--src-dsn"))
        .stdout(predicate::str::contains("--dst-dsn"))
        .stdout(predicate::str::contains("--ts-idx"))
        .stdout(predicate::str::contains("--chunk"))
        .stdout(predicate::str::contains("--fast-load"))
        .stdout(predicate::str::contains("--local-infile"));
}

#[test]
fn test_export_subcommand_help() {
    cmd()
        .args(["export", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dsn"))
        .stdout(predicate::str::contains("--table"))
        .stdout(predicate::str::contains("--where"))
        .stdout(predicate::str::contains("--throttle-rows"));
}

#[test]
fn test_load_subcommand_help() {
    cmd()
        .args(["load", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tar"))
        .stdout(predicate::str::contains("--dst-columns"))
        .stdout(predicate::str::contains("--uuidv7-from-index"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mysql-log-migrate"));
}

// =============================================================================
// Usage Error Tests (exit code 2)
// =============================================================================

#[test]
fn test_no_subcommand_is_usage_error() {
    cmd().assert().failure().code(2);
}

#[test]
fn test_unknown_subcommand_is_usage_error() {
    cmd().arg("shuffle").assert().failure().code(2);
}

#[test]
fn test_migrate_requires_dsns() {
    cmd()
        .arg("migrate")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--src-dsn"));
}

#[test]
fn test_export_requires_table() {
    cmd()
        .args(["export", "--dsn", "mysql://u:p@localhost/db"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--table"));
}

#[test]
fn test_load_requires_columns() {
    cmd()
        .args([
            "load",
            "--dsn",
            "mysql://u:p@localhost/db",
            "--tar",
            "export.tar.gz",
            "--dst-table",
            "log",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--dst-columns"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_migrate_rejects_dangerous_filter() {
    cmd()
        .args([
            "migrate",
            "--src-dsn",
            "mysql://u:p@localhost:1/src",
            "--dst-dsn",
            "mysql://u:p@localhost:1/dst",
            "--src-filter",
            "id > 1; DROP TABLE users",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("forbidden"));
}

#[test]
fn test_migrate_rejects_bad_timezone() {
    cmd()
        .args([
            "migrate",
            "--src-dsn",
            "mysql://u:p@localhost:1/src",
            "--dst-dsn",
            "mysql://u:p@localhost:1/dst",
            "--uuid-tz",
            "Nowhere/Invalid",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("timezone"));
}

#[test]
fn test_load_rejects_columns_without_uuid_first() {
    cmd()
        .args([
            "load",
            "--dsn",
            "mysql://u:p@localhost:1/dst",
            "--tar",
            "export.tar.gz",
            "--dst-table",
            "log",
            "--dst-columns",
            "nid,ins_ts,msg",
            "--uuidv7-from-index",
            "2",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("dst-columns"));
}
