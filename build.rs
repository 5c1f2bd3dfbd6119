use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

fn main() {
    // Get git revision
    let git_revision = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => {
            let hash = hash.trim().to_string();
            // Check if working directory is clean
            let is_dirty = git(&["status", "--porcelain"])
                .map(|status| !status.trim().is_empty())
                .unwrap_or(false);
            if is_dirty {
                format!("{}-dirty", hash)
            } else {
                hash
            }
        }
        None => "unknown".to_string(),
    };

    println!("cargo:rustc-env=GIT_REVISION={}", git_revision);

    // Rerun if .git directory changes
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
