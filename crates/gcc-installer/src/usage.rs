use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub label: String,
    pub kilobytes: u64,
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} DISK USAGE {}", self.label, self.kilobytes)
    }
}

/// Disk usage of `dir` in KiB, close to `du -sk`: per entry, the larger of
/// allocated blocks and apparent size (freshly written files may not have
/// blocks assigned yet). A hard-linked file is counted once per inode.
pub fn measure(label: &str, dir: &Path) -> Result<UsageReport> {
    if !dir.is_dir() {
        return Err(Error::msg(format!(
            "cannot measure {}: not a directory",
            dir.display()
        )));
    }

    let mut bytes: u64 = 0;
    let mut seen = HashSet::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let meta = entry.metadata().map_err(|e| {
            Error::msg(format!("failed to stat {}: {e}", entry.path().display()))
        })?;
        if let Some(key) = hard_link_key(&meta)
            && !seen.insert(key)
        {
            continue;
        }
        bytes = bytes.saturating_add(allocated_bytes(&meta));
    }

    Ok(UsageReport {
        label: label.to_string(),
        kilobytes: bytes.div_ceil(1024),
    })
}

#[cfg(unix)]
fn allocated_bytes(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks().saturating_mul(512).max(meta.len())
}

#[cfg(not(unix))]
fn allocated_bytes(meta: &std::fs::Metadata) -> u64 {
    meta.len()
}

// (device, inode) for regular files with more than one link.
#[cfg(unix)]
fn hard_link_key(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.is_file() && meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn hard_link_key(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}
