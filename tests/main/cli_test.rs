//! CLI contract tests.

use std::fs;
use std::path::PathBuf;

fn main_source() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/main.rs");
    let source_result = fs::read_to_string(&path);
    assert!(source_result.is_ok());
    match source_result {
        Ok(source) => source,
        Err(err) => panic!("main source should load from {}: {err}", path.display()),
    }
}

#[test]
fn main_defines_primary_subcommands() {
    let source = main_source();
    assert!(source.contains("Init"));
    assert!(source.contains("Start"));
    assert!(source.contains("Watch"));
    assert!(source.contains("Execute"));
    assert!(source.contains("Status"));
}

#[test]
fn main_defines_common_flags() {
    let source = main_source();
    for flag in ["once", "run_loop", "interval", "dry_run", "execute", "vault", "mode"] {
        assert!(source.contains(flag), "missing flag: {flag}");
    }
}

#[test]
fn main_defines_exit_codes() {
    let source = main_source();
    assert!(source.contains("EXIT_PARTIAL"));
    assert!(source.contains("EXIT_CONFIG"));
    assert!(source.contains("EXIT_AUTH"));
    assert!(source.contains("EXIT_CANCELLED"));
}
