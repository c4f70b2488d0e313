use std::env;
use std::process::Command;

fn main() {
    // Respect an explicitly provided commit (CI builds from tarballs).
    if env::var("GIT_COMMIT").is_ok() {
        println!("cargo:rerun-if-env-changed=GIT_COMMIT");
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        _ => {
            println!("cargo:warning=git commit unavailable, version will report unknown");
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=build.rs");
}
