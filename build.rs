fn main() {
    // RELEASE_VERSION is set by release builds; otherwise use the package version
    let release = std::env::var("RELEASE_VERSION").ok();
    let version = release
        .clone()
        .or_else(|| std::env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "0.0.0".to_string());

    let debug = std::env::var("PROFILE").map(|p| p == "debug").unwrap_or(false);
    let app_version = if debug && release.is_none() {
        format!("{version}-dev")
    } else {
        version
    };

    println!("cargo:rustc-env=APP_VERSION={app_version}");
    println!("cargo:rerun-if-env-changed=RELEASE_VERSION");
}
