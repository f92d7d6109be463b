use std::path::Path;

use gcc_installer_macros::{Module, Task};

use crate::error::Result;
use crate::executor::{ExecCtx, ExecEvent};
use crate::request::InstallRequest;
use crate::usage::{self, UsageReport};

#[Module(
    id = "report",
    tasks = [UsageTask],
    when = crate::request::InstallRequest::builds_toolchain
)]
pub struct ReportModule;

#[Task(
    id = "report.usage",
    module = "report",
    phase = "report",
    label = "Report disk usage",
    after = ["toolchain:installed"],
    provides = ["report:done"]
)]
pub struct UsageTask;

impl UsageTask {
    pub fn run(_req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace()?;
        checkpoint(ctx, "TEMP", &ws.root);
        checkpoint(ctx, "SOURCE", &ws.src);
        checkpoint(ctx, "BUILD", &ws.build);
        Ok(())
    }
}

/// Measures `dir` and emits a usage line. Diagnostic only: a failed
/// measurement is reported as a warning and never fails the task.
pub fn checkpoint(ctx: &ExecCtx, label: &str, dir: &Path) -> Option<UsageReport> {
    match usage::measure(label, dir) {
        Ok(report) => {
            tracing::info!(label, kilobytes = report.kilobytes, "disk usage");
            ctx.sink.emit(ExecEvent::DiskUsage {
                report: report.clone(),
            });
            Some(report)
        }
        Err(e) => {
            tracing::warn!(label, dir = %dir.display(), error = %e, "disk usage unavailable");
            ctx.log(&format!("WARN: {label} disk usage unavailable: {e}"));
            None
        }
    }
}
