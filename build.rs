use std::process::Command;

fn run_git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim_end_matches('\n').to_string())
}

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");

    // Tag the build with the commit it came from, when there is one.
    let version = match run_git(&["rev-parse", "--short", "HEAD"]) {
        Some(mut hash) => {
            let dirty = !Command::new("git")
                .args(["diff-index", "--quiet", "HEAD"])
                .status()
                .map(|status| status.success())
                .unwrap_or(true);
            if dirty {
                hash.push_str("-dirty");
            }
            format!("{} at {}", env!("CARGO_PKG_VERSION"), hash)
        }
        None => format!("{} at no-git", env!("CARGO_PKG_VERSION")),
    };

    println!("cargo::rustc-env=BUNKERD_BUILD_VERSION={version}");
}
