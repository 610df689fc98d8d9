use std::{env, fs, path::PathBuf, process::Command};

fn main() {
    if let Err(err) = emit_version_module() {
        panic!("failed to generate version.rs: {err}");
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=NETLAB_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}

fn emit_version_module() -> anyhow::Result<()> {
    let version = env::var("CARGO_PKG_VERSION")?;
    let git_sha = env::var("NETLAB_GIT_SHA")
        .ok()
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
        .or_else(short_head)
        .unwrap_or_else(|| "unknown".into());
    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let out = PathBuf::from(env::var("OUT_DIR")?).join("version.rs");
    fs::write(
        out,
        format!(
            "pub const VERSION: &str = {version:?};\n\
             pub const GIT_SHA: &str = {git_sha:?};\n\
             pub const BUILD_TIMESTAMP: &str = {built_at:?};\n"
        ),
    )?;
    Ok(())
}

fn short_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
