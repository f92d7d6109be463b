use crate::error::Result;
use crate::planner::Plan;
use crate::request::InstallRequest;

pub mod patch;
pub mod report;
pub mod source;
pub mod toolchain;
pub mod workspace;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, req: &InstallRequest) -> bool;
    fn plan(&self, req: &InstallRequest, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(workspace::WorkspaceModule),
        Box::new(source::SourceModule),
        Box::new(patch::PatchModule),
        Box::new(toolchain::ToolchainModule),
        Box::new(report::ReportModule),
    ]
}

/// The task plan for one request. Which modules take part is what separates
/// a full build from a download-only run.
pub fn plan_for(req: &InstallRequest) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(req) {
            tracing::debug!(module = m.id(), "planning module");
            m.plan(req, &mut plan)?;
        }
    }
    Ok(plan)
}
