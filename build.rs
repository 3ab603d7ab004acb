// build.rs

use std::env;

fn main() {
    // Desktop packaging stamps the released version through the environment
    // so the backend reports the bundle version, not the crate version.
    // Local builds fall back to CARGO_PKG_VERSION untouched.
    if let Ok(version) = env::var("KUBEDECK_VERSION") {
        println!("cargo:rustc-env=CARGO_PKG_VERSION={version}");
    }
    println!("cargo:rerun-if-env-changed=KUBEDECK_VERSION");
}
