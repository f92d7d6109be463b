use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::net::Transport;
use crate::planner::Plan;
use crate::request::InstallRequest;
use crate::usage::UsageReport;
use crate::workspace::Workspace;

pub type TaskExecFn = fn(&InstallRequest, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    WorkspaceReady {
        root: PathBuf,
    },
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    DiskUsage {
        report: UsageReport,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::WorkspaceReady { root } => {
                if let Ok(mut s) = self.state.lock() {
                    s.error_logs_dir = Some(root.join("logs"));
                }
                println!("WORKSPACE: {}", root.display());
            }
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    append_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let err_text = error.unwrap_or_default();
                let mut written = None::<PathBuf>;
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                        s.task_logs.remove(&id);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id.clone());
                        match write_task_error_log(&mut s, &id, &err_text, elapsed_ms) {
                            Ok(path) => written = path,
                            Err(e) => println!("WARN: failed to write task error log for {id}: {e}"),
                        }
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                }
                if let Some(path) = written {
                    println!("ERROR_LOG: {id} => {}", path.display());
                }
            }
            ExecEvent::DiskUsage { report } => {
                println!("{report}");
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let mut summary = String::from("SUMMARY:\n");
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                    summary.push_str(&format!(
                        "  tasks: started={} ok={} failed={}\n",
                        s.tasks_started, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    if !s.failed_tasks.is_empty() {
                        summary.push_str(&format!("  failed_tasks: {}\n", s.failed_tasks.join(", ")));
                    }
                    for p in &s.error_log_paths {
                        summary.push_str(&format!("  error_log: {}\n", p.display()));
                    }
                    *s = StdoutSinkState::default();
                }
                if !ok && let Some(e) = error {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                print!("{summary}");
            }
        }
    }
}

/// Runs one external command to completion, forwarding its output lines.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: Command, log: &dyn Fn(&str)) -> Result<()>;
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, mut cmd: Command, log: &dyn Fn(&str)) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            // Build tools never need input; a stray read must not block the pipeline.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {program} failed: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!("{program} failed: {status}")));
        }
        Ok(())
    }
}

/// Renders a command the way a shell user would type it.
pub fn describe_cmd(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    let line = parts.join(" ");
    match cmd.get_current_dir() {
        Some(dir) => format!("(cd {} && {line})", dir.display()),
        None => line,
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub runner: Arc<dyn CommandRunner>,
    pub transport: Arc<dyn Transport>,
    pub current_task_id: Option<String>,
    workspace: Option<Workspace>,
}

impl ExecCtx {
    pub fn new(
        dry_run: bool,
        sink: Arc<dyn ExecSink>,
        runner: Arc<dyn CommandRunner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            dry_run,
            sink,
            runner,
            transport,
            current_task_id: None,
            workspace: None,
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace(&mut self, ws: Workspace) {
        self.sink.emit(ExecEvent::WorkspaceReady {
            root: ws.root.clone(),
        });
        self.workspace = Some(ws);
    }

    pub fn workspace(&self) -> Result<&Workspace> {
        self.workspace
            .as_ref()
            .ok_or_else(|| Error::msg("workspace has not been created"))
    }

    pub fn take_workspace(&mut self) -> Option<Workspace> {
        self.workspace.take()
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        self.log(&format!("$ {}", describe_cmd(&cmd)));
        let forward = |line: &str| self.log(line);
        self.runner.run(cmd, &forward)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules::{patch, report, source, toolchain, workspace};

    let mut reg = TaskRegistry::default();
    workspace::WorkspaceModule::register_tasks(&mut reg)?;
    source::SourceModule::register_tasks(&mut reg)?;
    patch::PatchModule::register_tasks(&mut reg)?;
    toolchain::ToolchainModule::register_tasks(&mut reg)?;
    report::ReportModule::register_tasks(&mut reg)?;
    Ok(reg)
}

/// Runs the plan in order, stopping at the first failing task.
pub fn execute_plan(
    req: &InstallRequest,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        tracing::debug!(task = %task.id, phase = %task.phase, "task started");

        let start = Instant::now();
        let res = exec(req, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                tracing::error!(task = %task.id, error = %e, "task failed");
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let err = Error::msg(format!("task '{}' failed: {e}", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    // Compiler builds are chatty; only the tail matters when something fails.
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<Option<PathBuf>> {
    // Nothing to write into until the workspace exists.
    let Some(dir) = state.error_logs_dir.clone() else {
        return Ok(None);
    };
    if !dir.parent().is_some_and(Path::is_dir) {
        return Ok(None);
    }
    fs::create_dir_all(&dir).map_err(|e| {
        Error::msg(format!(
            "failed to create error logs dir {}: {e}",
            dir.display()
        ))
    })?;
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = String::new();
    body.push_str(&format!("task: {task_id}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    if let Some(lines) = state.task_logs.get(task_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(Some(path))
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
