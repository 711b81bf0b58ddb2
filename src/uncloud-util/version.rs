//! Process-wide version string, initialized once at startup and never
//! mutated again — the "global mutable state" design note in spec §9
//! applies here the same way it does to Garage's `garage_util::version`.

use std::sync::OnceLock;

static VERSION: OnceLock<String> = OnceLock::new();

/// Must be called exactly once, from `main`, before any other component
/// reads it.
pub fn init_version(git_version: &str) {
	VERSION
		.set(format!("uncloud {}", git_version))
		.expect("init_version called twice");
}

/// Returns the version string, or a placeholder if `init_version` was
/// never called (e.g. in unit tests).
pub fn uncloud_version() -> &'static str {
	VERSION.get().map(String::as_str).unwrap_or("uncloud (dev)")
}
