use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::request::InstallRequest;

/// Who is running: the three values that make a workspace root unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub user: String,
    pub host: String,
    pub pid: u32,
}

impl RunIdentity {
    pub fn current() -> Self {
        Self {
            user: current_user(),
            host: current_host(),
            pid: std::process::id(),
        }
    }

    // GCC's configure and libtool split on some characters that are legal in
    // user and host names ('.', ':', spaces), so keep only [A-Za-z0-9_-].
    pub fn dir_name(&self) -> String {
        format!(
            "gcc_{}_{}_{}",
            sanitize_component(&self.user),
            sanitize_component(&self.host),
            self.pid
        )
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub temp_root: PathBuf,
    pub root: PathBuf,
    pub src: PathBuf,
    pub build: PathBuf,
    pub archive: PathBuf,
}

#[derive(Serialize)]
struct RequestRecord<'a> {
    created_at: String,
    user: &'a str,
    host: &'a str,
    pid: u32,
    request: &'a InstallRequest,
}

impl Workspace {
    /// Where the workspace for `identity` lives under `temp_root`.
    pub fn locate(temp_root: &Path, identity: &RunIdentity) -> Self {
        let root = temp_root.join(identity.dir_name());
        Self {
            temp_root: temp_root.to_path_buf(),
            src: root.join("src"),
            build: root.join("build"),
            archive: root.join("archive"),
            root,
        }
    }

    /// Creates the root and its fixed subdirectories.
    ///
    /// The root must not exist yet: uniqueness comes from the process
    /// identity, so an existing directory means a stale or foreign run.
    pub fn create(req: &InstallRequest, identity: &RunIdentity) -> Result<Self> {
        set_file_creation_mask();

        let ws = Self::locate(&req.temp_root, identity);
        fs::create_dir_all(&ws.temp_root).map_err(|e| {
            Error::msg(format!(
                "failed to create temp root {}: {e}",
                ws.temp_root.display()
            ))
        })?;
        fs::create_dir(&ws.root).map_err(|e| {
            Error::msg(format!(
                "failed to create workspace root {}: {e}",
                ws.root.display()
            ))
        })?;
        for dir in [&ws.src, &ws.build, &ws.archive] {
            fs::create_dir(dir).map_err(|e| {
                Error::msg(format!("failed to create dir {}: {e}", dir.display()))
            })?;
        }

        let record = RequestRecord {
            created_at: chrono::Local::now().to_rfc3339(),
            user: &identity.user,
            host: &identity.host,
            pid: identity.pid,
            request: req,
        };
        let json = serde_json::to_string_pretty(&record)?;
        let record_path = ws.root.join("request.json");
        fs::write(&record_path, json).map_err(|e| {
            Error::msg(format!("failed to write {}: {e}", record_path.display()))
        })?;

        Ok(ws)
    }

    /// Removes the whole tree. Only called after a fully successful run.
    pub fn teardown(self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let temp_can = self
            .temp_root
            .canonicalize()
            .unwrap_or_else(|_| self.temp_root.clone());
        let root_can = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        if root_can == temp_can || !root_can.starts_with(&temp_can) {
            return Err(Error::msg(format!(
                "refusing to remove '{}' (not inside temp root '{}')",
                root_can.display(),
                temp_can.display()
            )));
        }
        fs::remove_dir_all(&root_can).map_err(|e| {
            Error::msg(format!(
                "failed to remove workspace {}: {e}",
                root_can.display()
            ))
        })
    }

    /// Fails unless `src` holds a materialized tree.
    pub fn ensure_source_tree(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.src).map_err(|e| {
            Error::msg(format!(
                "source tree {} is missing: {e}",
                self.src.display()
            ))
        })?;
        if entries.next().is_none() {
            return Err(Error::msg(format!(
                "source tree {} is empty",
                self.src.display()
            )));
        }
        Ok(())
    }
}

// Installed files must be readable (and directories searchable) by group and
// others regardless of the invoking user's umask.
fn set_file_creation_mask() {
    #[cfg(unix)]
    {
        let previous = unsafe { libc::umask(0o022) };
        tracing::debug!("umask set to 022 (was {previous:03o})");
    }
}

fn sanitize_component(raw: &str) -> String {
    let out: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "unknown".into() } else { out }
}

fn current_user() -> String {
    for key in ["USER", "LOGNAME"] {
        if let Ok(v) = std::env::var(key)
            && !v.trim().is_empty()
        {
            return v;
        }
    }
    fallback_user()
}

#[cfg(unix)]
fn fallback_user() -> String {
    format!("uid{}", unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn fallback_user() -> String {
    "unknown".into()
}

fn current_host() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..len]).into_owned();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}
