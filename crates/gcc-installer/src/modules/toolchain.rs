use std::path::{Path, PathBuf};
use std::process::Command;

use gcc_installer_macros::{Module, Task};

use crate::error::Result;
use crate::executor::ExecCtx;
use crate::request::{AbiMode, InstallRequest};

#[Module(
    id = "toolchain",
    tasks = [ConfigureTask, CompileTask, InstallTask],
    when = crate::request::InstallRequest::builds_toolchain
)]
pub struct ToolchainModule;

pub const LEGACY_ABI_FLAG: &str = "--with-default-libstdcxx-abi=gcc4-compatible";

/// Configure flags derived from the request alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub prefix: PathBuf,
    pub legacy_abi: bool,
    pub languages: Option<String>,
}

impl BuildOptions {
    pub fn from_request(req: &InstallRequest) -> Self {
        Self {
            prefix: req.install_dir.clone(),
            legacy_abi: req.abi == AbiMode::Legacy,
            languages: req.languages.clone(),
        }
    }

    pub fn configure_args(&self) -> Vec<String> {
        let mut args = vec![format!("--prefix={}", self.prefix.display())];
        if self.legacy_abi {
            args.push(LEGACY_ABI_FLAG.to_string());
        }
        args.extend(
            ["--enable-threads=posix", "--enable-tls", "--disable-multilib"]
                .map(String::from),
        );
        if let Some(langs) = &self.languages {
            args.push(format!("--enable-languages={langs}"));
        }
        args
    }
}

pub fn configure_command(src: &Path, build: &Path, opts: &BuildOptions) -> Command {
    let mut cmd = Command::new(src.join("configure"));
    cmd.args(opts.configure_args()).current_dir(build);
    cmd
}

pub fn compile_command(build: &Path, jobs: usize) -> Command {
    let mut cmd = Command::new("make");
    cmd.arg(format!("-j{jobs}")).current_dir(build);
    cmd
}

pub fn install_command(build: &Path, strip: bool) -> Command {
    let mut cmd = Command::new("make");
    cmd.arg(if strip { "install-strip" } else { "install" })
        .current_dir(build);
    cmd
}

#[Task(
    id = "toolchain.configure",
    module = "toolchain",
    phase = "configure",
    label = "Configure GCC",
    after = ["source:measured", "source:patched?"],
    provides = ["toolchain:configured"]
)]
pub struct ConfigureTask;

impl ConfigureTask {
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace()?;
        ws.ensure_source_tree()?;
        let cmd = configure_command(&ws.src, &ws.build, &BuildOptions::from_request(req));
        ctx.run_cmd(cmd).map_err(|e| e.context("configure"))
    }
}

#[Task(
    id = "toolchain.compile",
    module = "toolchain",
    phase = "compile",
    label = "Compile GCC",
    after = ["toolchain:configured"],
    provides = ["toolchain:compiled"]
)]
pub struct CompileTask;

impl CompileTask {
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let cmd = compile_command(&ctx.workspace()?.build, req.jobs);
        ctx.run_cmd(cmd).map_err(|e| e.context("make"))
    }
}

#[Task(
    id = "toolchain.install",
    module = "toolchain",
    phase = "install",
    label = "Install GCC",
    after = ["toolchain:compiled"],
    provides = ["toolchain:installed"]
)]
pub struct InstallTask;

impl InstallTask {
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let cmd = install_command(&ctx.workspace()?.build, req.strip);
        ctx.run_cmd(cmd).map_err(|e| e.context("make install"))?;
        ctx.log(&format!("installed into {}", req.install_dir.display()));
        Ok(())
    }
}
