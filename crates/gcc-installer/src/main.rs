use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use gcc_installer::Result;
use gcc_installer::config::{ENV_LOG, EnvConfig};
use gcc_installer::executor::{self, ExecCtx, ProcessRunner, StdoutSink};
use gcc_installer::net::NetTransport;
use gcc_installer::request::{AbiMode, DEFAULT_JOBS, InstallRequest, RequestArgs};

/// Build and install GCC from source in a throwaway workspace.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Installation prefix
    #[arg(short = 'd', value_name = "INSTALL_DIR")]
    install_dir: PathBuf,
    /// Release version (e.g. 8.2.0), or a repository path with -r
    #[arg(short = 'v', id = "gcc_version", value_name = "VERSION")]
    gcc_version: String,
    /// Default libstdc++ ABI
    #[arg(short = 'o', value_enum, value_name = "ABI")]
    abi: Option<AbiArg>,
    /// Check out from the source repository instead of downloading a release
    #[arg(short = 'r')]
    from_repo: bool,
    /// Parallel make jobs (0 = use CPU count)
    #[arg(short = 'j', value_name = "NUM_JOBS", default_value_t = DEFAULT_JOBS)]
    jobs: usize,
    /// Stop after preparing the source tree and keep the workspace
    #[arg(short = 'x')]
    download_only: bool,
    /// Patch to apply with `patch -p1` (repeatable, applied in order)
    #[arg(short = 'p', value_name = "PATCH_FILE")]
    patches: Vec<PathBuf>,
    /// Print what would run without executing task bodies
    #[arg(long)]
    dry_run: bool,
    /// Print the ordered task plan and exit
    #[arg(long)]
    plan: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AbiArg {
    #[value(name = "old_abi")]
    OldAbi,
    #[value(name = "new_abi")]
    NewAbi,
}

impl Args {
    fn request_args(&self) -> RequestArgs {
        RequestArgs {
            install_dir: self.install_dir.clone(),
            version: self.gcc_version.clone(),
            abi: match self.abi {
                Some(AbiArg::OldAbi) => AbiMode::Legacy,
                Some(AbiArg::NewAbi) | None => AbiMode::Default,
            },
            from_repo: self.from_repo,
            jobs: self.jobs,
            download_only: self.download_only,
            patches: self.patches.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let request_args = args.request_args();
    if let Err(e) = request_args.validate() {
        Args::command()
            .error(ErrorKind::ValueValidation, e.to_string())
            .exit();
    }
    dotenv::dotenv().ok();
    init_tracing();

    match run(&args, request_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e.one_line());
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: &Args, request_args: RequestArgs) -> Result<()> {
    let env = EnvConfig::from_env()?;
    let req = InstallRequest::resolve(request_args, env)?;
    tracing::debug!(?req, "resolved request");

    let plan = gcc_installer::modules::plan_for(&req)?;
    if args.plan {
        for (i, task) in plan.ordered()?.iter().enumerate() {
            println!(
                "{:>2}. {:<22}  {:<10} {:<10}  {}",
                i + 1,
                task.id,
                task.module,
                task.phase,
                task.label
            );
        }
        return Ok(());
    }

    let reg = executor::builtin_registry()?;
    let mut ctx = ExecCtx::new(
        args.dry_run,
        Arc::new(StdoutSink::default()),
        Arc::new(ProcessRunner),
        Arc::new(NetTransport::new()?),
    );
    executor::execute_plan(&req, &plan, &reg, &mut ctx)?;

    if req.download_only
        && let Ok(ws) = ctx.workspace()
    {
        println!("source tree kept at {}", ws.src.display());
    }
    Ok(())
}
