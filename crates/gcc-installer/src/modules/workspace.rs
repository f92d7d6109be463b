use gcc_installer_macros::{Module, Task};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::request::InstallRequest;
use crate::workspace::{RunIdentity, Workspace};

#[Module(id = "workspace", tasks = [CreateTask, TeardownTask])]
pub struct WorkspaceModule;

#[Task(
    id = "workspace.create",
    module = "workspace",
    phase = "init",
    label = "Create workspace",
    provides = ["workspace:ready"]
)]
pub struct CreateTask;

impl CreateTask {
    pub fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let identity = RunIdentity::current();
        ctx.log(&format!("temp root = {}", req.temp_root.display()));
        let ws = Workspace::create(req, &identity)?;
        ctx.log(&format!("workspace.root = {}", ws.root.display()));
        ctx.log(&format!("workspace.src = {}", ws.src.display()));
        ctx.log(&format!("workspace.build = {}", ws.build.display()));
        ctx.log(&format!("workspace.archive = {}", ws.archive.display()));
        tracing::info!(root = %ws.root.display(), "workspace created");
        ctx.set_workspace(ws);
        Ok(())
    }
}

// Planned for full builds only: download-only runs keep the prepared tree,
// and a failed run never gets this far.
#[Task(
    id = "workspace.teardown",
    module = "workspace",
    phase = "teardown",
    label = "Remove workspace",
    after = ["report:done"],
    when = crate::request::InstallRequest::builds_toolchain
)]
pub struct TeardownTask;

impl TeardownTask {
    pub fn run(_req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx
            .take_workspace()
            .ok_or_else(|| Error::msg("workspace has not been created"))?;
        let root = ws.root.clone();
        ws.teardown()?;
        ctx.log(&format!("removed {}", root.display()));
        tracing::info!(root = %root.display(), "workspace removed");
        Ok(())
    }
}
