use std::path::Path;
use std::process::Command;

/// Exports libtorch location variables from `setup_env.sh` when building the
/// `libtorch` feature.
fn main() {
    println!("cargo:rerun-if-changed=setup_env.sh");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LIBTORCH");

    if std::env::var_os("CARGO_FEATURE_LIBTORCH").is_none() || !Path::new("setup_env.sh").exists() {
        return;
    }

    let output = match Command::new("sh").arg("-c").arg(". ./setup_env.sh && env").output() {
        Ok(output) => output,
        Err(e) => {
            println!("cargo:warning=could not run setup_env.sh: {e}");
            return;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let exported = [
        "LIBTORCH=",
        "LD_LIBRARY_PATH=",
        "DYLD_LIBRARY_PATH=",
        "LIBTORCH_USE_PYTORCH=",
        "LIBTORCH_BYPASS_VERSION_CHECK=",
    ];
    for line in stdout.lines() {
        if exported.iter().any(|prefix| line.starts_with(prefix)) {
            println!("cargo:rustc-env={line}");
        }
    }
}
