use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::EnvConfig;
use crate::error::{Error, Result};

pub const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiMode {
    #[default]
    Default,
    Legacy,
}

/// Raw values as they arrive from the command line.
#[derive(Debug, Clone, Default)]
pub struct RequestArgs {
    pub install_dir: PathBuf,
    pub version: String,
    pub abi: AbiMode,
    pub from_repo: bool,
    pub jobs: usize,
    pub download_only: bool,
    pub patches: Vec<PathBuf>,
}

/// Everything one pipeline run needs to know, resolved once up front.
///
/// Paths are absolute so that tasks can change working directory freely.
#[derive(Debug, Clone, Serialize)]
pub struct InstallRequest {
    pub version: String,
    pub install_dir: PathBuf,
    pub from_repo: bool,
    pub jobs: usize,
    pub download_only: bool,
    pub abi: AbiMode,
    pub patches: Vec<PathBuf>,
    pub temp_root: PathBuf,
    pub languages: Option<String>,
    pub strip: bool,
    pub mirror_template: String,
    pub repository: String,
}

impl RequestArgs {
    /// Checks the values themselves, before anything touches the environment.
    /// Failures here are usage errors.
    pub fn validate(&self) -> Result<()> {
        let version = self.version.trim();
        if version.is_empty() {
            return Err(Error::msg("version is empty"));
        }
        if !self.from_repo && version.contains('/') {
            return Err(Error::msg(format!(
                "archive mode expects a release version like '8.2.0', got '{version}' (use -r for repository paths)"
            )));
        }
        if self.install_dir.as_os_str().is_empty() {
            return Err(Error::msg("install directory is empty"));
        }
        if self.patches.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(Error::msg("patch path is empty"));
        }
        Ok(())
    }
}

impl InstallRequest {
    pub fn resolve(args: RequestArgs, env: EnvConfig) -> Result<Self> {
        args.validate()?;
        let version = args.version.trim().to_string();

        let jobs = if args.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            args.jobs
        };

        let mut patches = Vec::with_capacity(args.patches.len());
        for p in &args.patches {
            patches.push(absolute(p)?);
        }

        Ok(Self {
            version,
            install_dir: absolute(&args.install_dir)?,
            from_repo: args.from_repo,
            jobs,
            download_only: args.download_only,
            abi: args.abi,
            patches,
            temp_root: absolute(&env.temp_root)?,
            languages: env.languages,
            strip: env.strip,
            mirror_template: env.mirror_template,
            repository: env.repository,
        })
    }

    /// Full builds run configure/compile/install, the final report, and teardown.
    pub fn builds_toolchain(&self) -> bool {
        !self.download_only
    }

    pub fn has_patches(&self) -> bool {
        !self.patches.is_empty()
    }
}

fn absolute(p: &Path) -> Result<PathBuf> {
    if p.as_os_str().is_empty() {
        return Err(Error::msg("empty path"));
    }
    std::path::absolute(p)
        .map_err(|e| Error::msg(format!("failed to resolve {}: {e}", p.display())))
}
