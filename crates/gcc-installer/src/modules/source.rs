use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use gcc_installer_macros::{Module, Task};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::report::checkpoint;
use crate::net::{Transport, TransportKind};
use crate::request::InstallRequest;
use crate::workspace::Workspace;

#[Module(id = "source", tasks = [FetchTask, PrerequisitesTask, MeasureTask])]
pub struct SourceModule;

/// Release archive compressions, in the order mirrors are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Xz,
    Bz2,
    Gz,
}

impl CompressionFormat {
    pub const PRIORITY: [Self; 3] = [Self::Xz, Self::Bz2, Self::Gz];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Xz => "tar.xz",
            Self::Bz2 => "tar.bz2",
            Self::Gz => "tar.gz",
        }
    }

    pub fn tar_flag(self) -> &'static str {
        match self {
            Self::Xz => "-xJf",
            Self::Bz2 => "-xjf",
            Self::Gz => "-xzf",
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::PRIORITY
            .into_iter()
            .find(|f| name.ends_with(&format!(".{}", f.extension())))
            .ok_or_else(|| {
                Error::msg(format!(
                    "unrecognized archive format: {}",
                    path.display()
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveCandidate {
    pub url: String,
    pub format: CompressionFormat,
    pub transport: Option<TransportKind>,
}

impl ArchiveCandidate {
    /// Last path segment of the URL; where the download lands in `archive/`.
    pub fn file_name(&self) -> Result<&str> {
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::msg(format!("archive URL has no file name: {}", self.url)))
    }
}

/// Expands `{version}` and `{ext}` in the mirror template for each format.
pub fn archive_candidates(template: &str, version: &str) -> Vec<ArchiveCandidate> {
    CompressionFormat::PRIORITY
        .into_iter()
        .map(|format| {
            let url = template
                .replace("{version}", version)
                .replace("{ext}", format.extension());
            ArchiveCandidate {
                transport: TransportKind::from_url(&url),
                url,
                format,
            }
        })
        .collect()
}

/// First candidate the transport confirms exists. Later candidates are never
/// probed once one succeeds.
pub fn select_candidate<'a>(
    candidates: &'a [ArchiveCandidate],
    transport: &dyn Transport,
    log: &dyn Fn(&str),
) -> Result<&'a ArchiveCandidate> {
    for cand in candidates {
        let Some(kind) = cand.transport else {
            log(&format!("skip {} (unsupported scheme)", cand.url));
            continue;
        };
        match transport.probe(kind, &cand.url) {
            Ok(true) => {
                log(&format!("found {}", cand.url));
                return Ok(cand);
            }
            Ok(false) => log(&format!("missing {}", cand.url)),
            Err(e) => {
                tracing::warn!(url = %cand.url, error = %e, "archive probe failed");
                log(&format!("probe failed for {}: {e}", cand.url));
            }
        }
    }
    Err(Error::msg("no archive found"))
}

pub fn checkout_command(repository: &str, version: &str, src: &Path) -> Command {
    let mut cmd = Command::new("svn");
    cmd.arg("checkout")
        .arg(format!("{}/{}", repository.trim_end_matches('/'), version))
        .arg(src);
    cmd
}

pub fn extract_command(archive: &Path, src: &Path) -> Result<Command> {
    let format = CompressionFormat::from_path(archive)?;
    let mut cmd = Command::new("tar");
    cmd.arg(format.tar_flag())
        .arg(archive)
        .arg("-C")
        .arg(src)
        .arg("--strip-components=1");
    Ok(cmd)
}

pub fn prerequisites_command(src: &Path) -> Command {
    let mut cmd = Command::new(src.join("contrib").join("download_prerequisites"));
    cmd.current_dir(src);
    cmd
}

#[Task(
    id = "source.fetch",
    module = "source",
    phase = "fetch",
    label = "Fetch GCC sources",
    after = ["workspace:ready"],
    provides = ["source:fetched"]
)]
pub struct FetchTask;

impl FetchTask {
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace()?.clone();
        if req.from_repo {
            ctx.run_cmd(checkout_command(&req.repository, &req.version, &ws.src))
                .map_err(|e| e.context("svn checkout"))?;
        } else {
            let archive = download_archive(req, ctx, &ws)?;
            ctx.run_cmd(extract_command(&archive, &ws.src)?)
                .map_err(|e| e.context("extract"))?;
        }
        ws.ensure_source_tree()
    }
}

fn download_archive(req: &InstallRequest, ctx: &ExecCtx, ws: &Workspace) -> Result<PathBuf> {
    let candidates = archive_candidates(&req.mirror_template, &req.version);
    let log = |line: &str| ctx.log(line);
    let chosen = select_candidate(&candidates, ctx.transport.as_ref(), &log)?;
    let Some(kind) = chosen.transport else {
        return Err(Error::msg(format!("no transport for {}", chosen.url)));
    };

    let dest = ws.archive.join(chosen.file_name()?);
    ctx.log(&format!("download {} -> {}", chosen.url, dest.display()));
    ctx.transport
        .download(kind, &chosen.url, &dest)
        .map_err(|e| e.context(&format!("download {}", chosen.url)))?;

    let digest = sha256_file_hex(&dest)?;
    ctx.log(&format!("sha256 {digest}  {}", dest.display()));
    tracing::info!(archive = %dest.display(), sha256 = %digest, "archive downloaded");
    Ok(dest)
}

fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[Task(
    id = "source.prerequisites",
    module = "source",
    phase = "fetch",
    label = "Download GCC prerequisites",
    after = ["source:fetched"],
    provides = ["source:tree"]
)]
pub struct PrerequisitesTask;

impl PrerequisitesTask {
    pub fn run(_req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let src = ctx.workspace()?.src.clone();
        ctx.run_cmd(prerequisites_command(&src))
            .map_err(|e| e.context("download_prerequisites"))
    }
}

#[Task(
    id = "source.measure",
    module = "source",
    phase = "report",
    label = "Measure source tree",
    after = ["source:tree"],
    provides = ["source:measured"]
)]
pub struct MeasureTask;

impl MeasureTask {
    pub fn run(_req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let src = ctx.workspace()?.src.clone();
        checkpoint(ctx, "SOURCE", &src);
        Ok(())
    }
}
