use std::path::Path;
use std::process::Command;

use gcc_installer_macros::{Module, Task};

use crate::error::Result;
use crate::executor::ExecCtx;
use crate::request::InstallRequest;

#[Module(
    id = "patch",
    tasks = [ApplyTask],
    when = crate::request::InstallRequest::has_patches
)]
pub struct PatchModule;

pub fn patch_command(src: &Path, patch: &Path) -> Command {
    let mut cmd = Command::new("patch");
    cmd.arg("-p1").arg("-i").arg(patch).current_dir(src);
    cmd
}

#[Task(
    id = "patch.apply",
    module = "patch",
    phase = "patch",
    label = "Apply source patches",
    after = ["source:measured"],
    provides = ["source:patched"]
)]
pub struct ApplyTask;

impl ApplyTask {
    /// Applies patches in the order given; the first rejected one stops the run.
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace()?;
        ws.ensure_source_tree()?;
        let src = ws.src.clone();
        let total = req.patches.len();
        for (i, patch) in req.patches.iter().enumerate() {
            ctx.log(&format!("patch {}/{total}: {}", i + 1, patch.display()));
            ctx.run_cmd(patch_command(&src, patch))
                .map_err(|e| e.context(format!("apply {}", patch.display())))?;
        }
        Ok(())
    }
}
