//! Thin platform capability layer: clocks, atomic file persistence and the
//! free-space probe. Everything else the core needs (mutexes, logging,
//! shutdown signal) comes straight from std / tracing / tokio.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Milliseconds since an arbitrary epoch, immune to wall-clock steps. Used
/// for cooldowns and pressure windows that must survive NTP corrections.
pub fn monotonic_ms() -> u64 {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) != 0 {
            return 0;
        }
        let secs = ts.tv_sec.max(0) as u64;
        let nanos = ts.tv_nsec.max(0) as u64;
        secs.saturating_mul(1000) + nanos / 1_000_000
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}

pub fn wall_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serialize `value` as pretty JSON and move it into place atomically.
/// The temp file is synced before the rename so a crash leaves either the
/// old file or the new one, never a torn half.
pub fn persist_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_data().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn free_bytes(dir: &Path) -> Result<u64> {
    let (_total, free) = statvfs_bytes(dir)?;
    Ok(free)
}

#[cfg(target_os = "linux")]
fn statvfs_bytes(dir: &Path) -> Result<(u64, u64)> {
    use std::ffi::CString;
    let cpath = CString::new(dir.as_os_str().to_string_lossy().as_bytes().to_vec())
        .context("invalid spool path")?;

    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out as *mut libc::statvfs) };
    if rc != 0 {
        return Err(anyhow!("statvfs failed"));
    }

    let block = if out.f_frsize > 0 {
        out.f_frsize as u64
    } else {
        out.f_bsize as u64
    };
    let total = (out.f_blocks as u64).saturating_mul(block);
    let free = (out.f_bavail as u64).saturating_mul(block);
    Ok((total, free))
}

#[cfg(not(target_os = "linux"))]
fn statvfs_bytes(_dir: &Path) -> Result<(u64, u64)> {
    Ok((u64::MAX, u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Marker {
        value: u64,
    }

    #[test]
    fn persist_json_atomic_replaces_previous_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        persist_json_atomic(&path, &Marker { value: 1 }).unwrap();
        persist_json_atomic(&path, &Marker { value: 2 }).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: Marker = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, Marker { value: 2 });
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
