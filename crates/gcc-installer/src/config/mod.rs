//! Environment-sourced settings.
//!
//! Everything that is not a command-line flag comes from the process
//! environment (after an optional `.env` file has been loaded by the binary).
//! Lookups go through a closure so tests never touch the real environment.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const ENV_TMPDIR: &str = "GCC_INSTALL_TMPDIR";
pub const ENV_LANGUAGES: &str = "GCC_INSTALL_LANGUAGES";
pub const ENV_STRIP: &str = "GCC_INSTALL_STRIP";
pub const ENV_MIRROR: &str = "GCC_INSTALL_MIRROR";
pub const ENV_REPO: &str = "GCC_INSTALL_REPO";
pub const ENV_LOG: &str = "GCC_INSTALL_LOG";

pub const DEFAULT_MIRROR_TEMPLATE: &str =
    "https://ftpmirror.gnu.org/gcc/gcc-{version}/gcc-{version}.{ext}";
pub const DEFAULT_REPOSITORY: &str = "svn://gcc.gnu.org/svn/gcc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub temp_root: PathBuf,
    pub languages: Option<String>,
    pub strip: bool,
    pub mirror_template: String,
    pub repository: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir(),
            languages: None,
            strip: false,
            mirror_template: DEFAULT_MIRROR_TEMPLATE.into(),
            repository: DEFAULT_REPOSITORY.into(),
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| {
            lookup(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let languages = get(ENV_LANGUAGES)
            .map(|raw| normalize_languages(&raw))
            .filter(|s| !s.is_empty());

        let strip = match get(ENV_STRIP).as_deref() {
            None | Some("0") => false,
            Some("1") => true,
            Some(other) => {
                return Err(Error::msg(format!(
                    "invalid {ENV_STRIP}='{other}' (expected 0 or 1)"
                )));
            }
        };

        let mirror_template = get(ENV_MIRROR).unwrap_or(defaults.mirror_template);
        if !mirror_template.contains("{ext}") {
            return Err(Error::msg(format!(
                "{ENV_MIRROR} must contain an '{{ext}}' placeholder: {mirror_template}"
            )));
        }

        Ok(Self {
            temp_root: get(ENV_TMPDIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_root),
            languages,
            strip,
            mirror_template,
            repository: get(ENV_REPO).unwrap_or(defaults.repository),
        })
    }
}

// "c, c++ ,fortran" -> "c,c++,fortran"
fn normalize_languages(raw: &str) -> String {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}
