// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Generates `env_names.rs`: one constant per environment variable the
//! daemon reads, plus `ALL` listing them for the startup log.

use std::fmt::Write as _;
use std::path::PathBuf;

/// (name, doc) of every variable orgsyncd consults.
const VARS: &[(&str, &str)] = &[
    ("ORGSYNC_STATE_DIR", "State directory for the store, key, lock and log."),
    ("ORGSYNC_RELAY_URL", "Relay URL; overrides the config file, not `--relay`."),
    ("XDG_STATE_HOME", "Base for the default state directory (`$XDG_STATE_HOME/orgsync`)."),
    ("RUST_LOG", "Log filter passed to tracing-subscriber's `EnvFilter`."),
];

fn render() -> String {
    let mut out = String::new();
    for (name, doc) in VARS {
        let _ = writeln!(out, "/// {doc}\npub const {name}: &str = \"{name}\";\n");
    }
    let _ = writeln!(out, "/// Every variable above, in declaration order.");
    let _ = writeln!(out, "pub const ALL: &[&str] = &[{}];", VARS.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", "));
    out
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    let Some(out_dir) = std::env::var_os("OUT_DIR").map(PathBuf::from) else {
        println!("cargo:warning=OUT_DIR not set");
        std::process::exit(1);
    };
    if let Err(e) = std::fs::write(out_dir.join("env_names.rs"), render()) {
        println!("cargo:warning=failed to write env_names.rs: {e}");
        std::process::exit(1);
    }
}
