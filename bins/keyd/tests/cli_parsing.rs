//! CLI argument parsing tests for keyd.
//!
//! These tests verify that command-line arguments are correctly parsed
//! without a running daemon.

use assert_cmd::Command;
use predicates::prelude::*;

fn keyd_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_keyd"))
}

mod global_flags {
    use super::*;

    #[test]
    fn test_help() {
        keyd_cmd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("PF_KEY v2 key engine"));
    }

    #[test]
    fn test_version() {
        keyd_cmd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("keyd"));
    }

    #[test]
    fn test_invalid_subcommand() {
        keyd_cmd()
            .arg("invalid_command")
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn test_missing_subcommand() {
        keyd_cmd().assert().failure();
    }
}

mod serve_command {
    use super::*;

    #[test]
    fn test_serve_help() {
        keyd_cmd()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--my-addr"))
            .stdout(predicate::str::contains("--config"));
    }

    #[test]
    fn test_serve_bad_config_path() {
        keyd_cmd()
            .args([
                "serve",
                "--socket",
                "/nonexistent-dir/keyd.sock",
                "--config",
                "/nonexistent-dir/keyd.json",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("keyd.json"));
    }

    #[test]
    fn test_serve_bad_address() {
        keyd_cmd()
            .args([
                "serve",
                "--socket",
                "/nonexistent-dir/keyd.sock",
                "--my-addr",
                "192.0.2.1/40",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--my-addr"));
    }
}

mod sa_commands {
    use super::*;

    #[test]
    fn test_flush_help() {
        keyd_cmd().args(["flush", "--help"]).assert().success();
    }

    #[test]
    fn test_flush_invalid_satype() {
        keyd_cmd()
            .args(["flush", "--satype", "rsvp"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid value"));
    }

    #[test]
    fn test_dump_accepts_json() {
        keyd_cmd()
            .args(["dump", "--satype", "esp", "--json", "--help"])
            .assert()
            .success();
    }

    #[test]
    fn test_dump_without_daemon() {
        keyd_cmd()
            .args(["--socket", "/nonexistent-dir/keyd.sock", "dump"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error"));
    }

    #[test]
    fn test_register_requires_satype() {
        keyd_cmd()
            .arg("register")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--satype"));
    }
}

mod spd_commands {
    use super::*;

    #[test]
    fn test_spd_dump_help() {
        keyd_cmd().args(["spd-dump", "--help"]).assert().success();
    }

    #[test]
    fn test_spd_add_help() {
        keyd_cmd()
            .args(["spd-add", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("esp-transport"));
    }

    #[test]
    fn test_spd_add_requires_action() {
        keyd_cmd()
            .args(["spd-add", "10.0.0.0/8", "10.1.0.0/16"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--action"));
    }

    #[test]
    fn test_spd_add_invalid_action() {
        keyd_cmd()
            .args(["spd-add", "10.0.0.0/8", "10.1.0.0/16", "--action", "encrypt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid value"));
    }

    #[test]
    fn test_spd_add_bad_selector() {
        keyd_cmd()
            .args([
                "--socket",
                "/nonexistent-dir/keyd.sock",
                "spd-add",
                "10.0.0.0/8[http]",
                "10.1.0.0/16",
                "--action",
                "discard",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("selector"));
    }
}
