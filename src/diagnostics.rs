//! Version strings, configuration summaries and temporary file names.

use crate::config::IoConfig;
use crate::engine::{LOAD_FORMATS, SAVE_FORMATS};
use crate::session::Session;
use crate::stats::StatsSnapshot;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

static VERSION: LazyLock<String> = LazyLock::new(|| {
    if env!("ON_RELEASE_TAG") == "true" {
        return env!("CARGO_PKG_VERSION").to_string();
    }
    match env!("GIT_HASH") {
        "" => "dev@unknown".to_string(),
        hash => format!("dev@{hash}"),
    }
});

/// Package version on release builds, `dev@<short hash>` otherwise.
pub fn version() -> &'static str {
    &VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPart {
    Major,
    Minor,
    Patch,
}

/// One numeric component of the package version.
pub fn version_part(part: VersionPart) -> u32 {
    let text = match part {
        VersionPart::Major => env!("CARGO_PKG_VERSION_MAJOR"),
        VersionPart::Minor => env!("CARGO_PKG_VERSION_MINOR"),
        VersionPart::Patch => env!("CARGO_PKG_VERSION_PATCH"),
    };
    text.parse().unwrap_or(0)
}

#[derive(Serialize)]
struct CacheSummary {
    max_operations: usize,
    max_mem: u64,
    max_files: usize,
    size: usize,
}

#[derive(Serialize)]
struct ConfigSummary<'a> {
    version: &'a str,
    load_formats: &'a [&'a str],
    save_formats: &'a [&'a str],
    concurrency: usize,
    auto_delete: bool,
    cache: CacheSummary,
    io: &'a IoConfig,
    blocked_operations: &'a [String],
    stats: StatsSnapshot,
}

impl Session {
    /// JSON description of the session's build and limits.
    pub fn config_summary(&self) -> Result<String, serde_json::Error> {
        let blocked = self.blocked_operations();
        let summary = ConfigSummary {
            version: version(),
            load_formats: LOAD_FORMATS,
            save_formats: SAVE_FORMATS,
            concurrency: self.concurrency(),
            auto_delete: self.auto_delete(),
            cache: CacheSummary {
                max_operations: self.cache_max(),
                max_mem: self.cache_max_mem(),
                max_files: self.cache_max_files(),
                size: self.cache_size(),
            },
            io: &self.config().io,
            blocked_operations: &blocked,
            stats: self.stats(),
        };
        serde_json::to_string_pretty(&summary)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh path in the system temp directory. `%s` in `format` is replaced
/// by a unique stem, so `temp_name("%s.png")` gives a `.png` path.
pub fn temp_name(format: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let stem = format!("imgbridge-{}-{n}", std::process::id());
    let name = if format.contains("%s") {
        format.replacen("%s", &stem, 1)
    } else {
        format!("{stem}{format}")
    };
    std::env::temp_dir().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_release_or_dev() {
        let v = version();
        assert!(
            v == env!("CARGO_PKG_VERSION") || v.starts_with("dev@"),
            "unexpected version {v}"
        );
    }

    #[test]
    fn version_parts_match_package() {
        let joined = format!(
            "{}.{}.{}",
            version_part(VersionPart::Major),
            version_part(VersionPart::Minor),
            version_part(VersionPart::Patch)
        );
        assert!(env!("CARGO_PKG_VERSION").starts_with(&joined));
    }

    #[test]
    fn temp_names_are_unique_and_keep_suffix() {
        let a = temp_name("%s.png");
        let b = temp_name("%s.png");
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "png");
        assert!(a.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn config_summary_is_json() {
        let session = Session::new().unwrap();
        session.set_cache_max(7);
        let json = session.config_summary().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cache"]["max_operations"], 7);
        assert_eq!(value["io"]["target_buffer_size"], 8500);
        assert_eq!(value["load_formats"][0], "png");
        assert!(value["concurrency"].as_u64().unwrap() >= 1);
    }
}
