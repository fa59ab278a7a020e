use std::process::Command;

// Stamps APP_VERSION for main.rs and the aggregate API response: the crate
// version, with "-nightly+<sha>" appended on nightly builds.
fn main() {
    let mut version = env!("CARGO_PKG_VERSION").to_string();
    if is_nightly_build() {
        version.push_str("-nightly");
        if let Some(sha) = short_sha() {
            version.push('+');
            version.push_str(&sha);
        }
    }

    println!("cargo:rustc-env=APP_VERSION={}", version);
    for trigger in ["PVCONTROL_NIGHTLY", "GIT_SHA"] {
        println!("cargo:rerun-if-env-changed={}", trigger);
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}

fn is_nightly_build() -> bool {
    match std::env::var("PVCONTROL_NIGHTLY") {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => false,
    }
}

fn short_sha() -> Option<String> {
    // CI sets GIT_SHA on checkouts without a .git directory
    if let Ok(sha) = std::env::var("GIT_SHA")
        && !sha.is_empty()
    {
        return Some(sha);
    }
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() { None } else { Some(sha) }
}
