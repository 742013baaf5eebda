#![allow(missing_docs)]

use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};

fn emit_release_var() -> Result<(), io::Error> {
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_default();

    let cmd = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .stderr(Stdio::null())
        .output();

    match cmd {
        Ok(output) if output.status.success() => {
            let revision = String::from_utf8_lossy(&output.stdout);
            println!("cargo:rustc-env=N6_RELEASE=n6@{version}+{}", revision.trim());
        }
        _ => println!("cargo:rustc-env=N6_RELEASE=n6@{version}"),
    }

    Ok(())
}

fn list_crates() -> Result<Vec<String>, io::Error> {
    let mut crates = Vec::new();

    for result in fs::read_dir("../")? {
        let entry = result?;

        if !entry.file_type()?.is_dir() {
            continue;
        }

        if let Some(s) = entry.file_name().to_str()
            && (s == "n6" || s.starts_with("n6-"))
        {
            crates.push(s.replace('-', "_"));
        }
    }

    crates.sort();
    Ok(crates)
}

fn emit_crate_list() -> Result<(), io::Error> {
    let crates = list_crates()?;

    let out_dir = env::var("OUT_DIR").map_err(io::Error::other)?;
    let dest_path = Path::new(&out_dir).join("constants.gen.rs");
    let mut f = File::create(dest_path)?;

    write!(f, "const CRATE_NAMES: &[&str] = &[")?;
    for name in &crates {
        write!(f, "\"{name}\",")?;
    }
    writeln!(f, "];")?;

    Ok(())
}

fn main() {
    emit_release_var().ok();
    if let Err(error) = emit_crate_list() {
        panic!("failed to emit crate list: {error}");
    }
}
