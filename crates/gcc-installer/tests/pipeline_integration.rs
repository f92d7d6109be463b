use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use gcc_installer::config::EnvConfig;
use gcc_installer::executor::{
    self, CommandRunner, ExecCtx, ExecEvent, ExecSink, describe_cmd,
};
use gcc_installer::net::{Transport, TransportKind};
use gcc_installer::request::{AbiMode, InstallRequest, RequestArgs};
use gcc_installer::{Error, Result};

#[derive(Default)]
struct CollectSink {
    events: Mutex<Vec<ExecEvent>>,
}

impl ExecSink for CollectSink {
    fn emit(&self, ev: ExecEvent) {
        self.events.lock().unwrap().push(ev);
    }
}

impl CollectSink {
    fn usage_lines(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ExecEvent::DiskUsage { report } => Some(report.to_string()),
                _ => None,
            })
            .collect()
    }

    fn workspace_root(&self) -> Option<PathBuf> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            ExecEvent::WorkspaceReady { root } => Some(root.clone()),
            _ => None,
        })
    }
}

/// Records every command. `tar` and `svn` leave a file in their target
/// directory so the source tree looks materialized.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl RecordingRunner {
    fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: Command, log: &dyn Fn(&str)) -> Result<()> {
        let line = describe_cmd(&cmd);
        self.calls.lock().unwrap().push(line.clone());
        if let Some(needle) = &self.fail_on
            && line.contains(needle.as_str())
        {
            log("simulated failure");
            return Err(Error::msg(format!("{} failed: exit status: 1", line)));
        }

        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let target = match &*cmd.get_program().to_string_lossy() {
            "tar" => args
                .iter()
                .position(|a| a == "-C")
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from),
            "svn" => args.last().map(PathBuf::from),
            _ => None,
        };
        if let Some(dir) = target {
            fs::write(dir.join("configure"), "#!/bin/sh\n").unwrap();
        }
        Ok(())
    }
}

struct ScriptedTransport {
    valid: BTreeMap<&'static str, bool>,
    probed: Mutex<Vec<String>>,
    downloaded: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(valid: &[(&'static str, bool)]) -> Self {
        Self {
            valid: valid.iter().copied().collect(),
            probed: Mutex::new(Vec::new()),
            downloaded: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for ScriptedTransport {
    fn probe(&self, _kind: TransportKind, url: &str) -> Result<bool> {
        self.probed.lock().unwrap().push(url.to_string());
        Ok(self
            .valid
            .iter()
            .any(|(ext, ok)| *ok && url.ends_with(ext)))
    }

    fn download(&self, _kind: TransportKind, url: &str, dest: &Path) -> Result<()> {
        self.downloaded.lock().unwrap().push(url.to_string());
        fs::write(dest, b"archive bytes")?;
        Ok(())
    }
}

fn request(temp_root: &Path, args: RequestArgs) -> InstallRequest {
    InstallRequest::resolve(
        args,
        EnvConfig {
            temp_root: temp_root.to_path_buf(),
            ..Default::default()
        },
    )
    .unwrap()
}

fn base_args() -> RequestArgs {
    RequestArgs {
        install_dir: PathBuf::from("/opt/gcc"),
        version: "8.2.0".into(),
        jobs: 4,
        ..Default::default()
    }
}

fn run(
    req: &InstallRequest,
    runner: Arc<RecordingRunner>,
    transport: Arc<ScriptedTransport>,
) -> (Result<()>, Arc<CollectSink>) {
    run_with(false, req, runner, transport)
}

fn run_with(
    dry_run: bool,
    req: &InstallRequest,
    runner: Arc<RecordingRunner>,
    transport: Arc<ScriptedTransport>,
) -> (Result<()>, Arc<CollectSink>) {
    let sink = Arc::new(CollectSink::default());
    let plan = gcc_installer::modules::plan_for(req).unwrap();
    let reg = executor::builtin_registry().unwrap();
    let mut ctx = ExecCtx::new(dry_run, sink.clone(), runner, transport);
    let res = executor::execute_plan(req, &plan, &reg, &mut ctx);
    (res, sink)
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[test]
fn full_archive_build_runs_in_order_and_removes_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let req = request(tmp.path(), base_args());
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[("tar.xz", true)]));

    let (res, sink) = run(&req, runner.clone(), transport.clone());
    res.unwrap();

    assert_eq!(
        *transport.downloaded.lock().unwrap(),
        vec!["https://ftpmirror.gnu.org/gcc/gcc-8.2.0/gcc-8.2.0.tar.xz"]
    );
    assert_eq!(transport.probed.lock().unwrap().len(), 1);

    let root = sink.workspace_root().unwrap();
    let src = root.join("src");
    let build = root.join("build");
    let archive = root.join("archive").join("gcc-8.2.0.tar.xz");
    assert_eq!(
        runner.calls(),
        vec![
            format!(
                "tar -xJf {} -C {} --strip-components=1",
                archive.display(),
                src.display()
            ),
            format!(
                "(cd {} && {}/contrib/download_prerequisites)",
                src.display(),
                src.display()
            ),
            format!(
                "(cd {} && {}/configure --prefix=/opt/gcc --enable-threads=posix --enable-tls --disable-multilib)",
                build.display(),
                src.display()
            ),
            format!("(cd {} && make -j4)", build.display()),
            format!("(cd {} && make install)", build.display()),
        ]
    );

    let labels: Vec<String> = sink
        .usage_lines()
        .iter()
        .map(|l| l.split(" DISK USAGE ").next().unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["SOURCE", "TEMP", "SOURCE", "BUILD"]);

    assert!(!root.exists(), "workspace should be removed on success");
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn legacy_abi_and_strip_reach_the_build_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args();
    args.abi = AbiMode::Legacy;
    let mut req = request(tmp.path(), args);
    req.strip = true;
    req.languages = Some("c,c++".into());
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[("tar.gz", true)]));

    let (res, _sink) = run(&req, runner.clone(), transport);
    res.unwrap();

    let calls = runner.calls();
    assert!(calls[0].starts_with("tar -xzf "));
    let configure = calls.iter().find(|c| c.contains("/configure ")).unwrap();
    assert!(configure.contains(
        "--prefix=/opt/gcc --with-default-libstdcxx-abi=gcc4-compatible --enable-threads=posix"
    ));
    assert!(configure.ends_with("--enable-languages=c,c++)"));
    assert!(calls.last().unwrap().ends_with("make install-strip)"));
}

#[test]
fn repository_mode_checks_out_instead_of_downloading() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args();
    args.version = "tags/gcc_8_2_0_release".into();
    args.from_repo = true;
    args.download_only = true;
    let req = request(tmp.path(), args);
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[]));

    let (res, sink) = run(&req, runner.clone(), transport.clone());
    res.unwrap();

    let src = sink.workspace_root().unwrap().join("src");
    assert_eq!(
        runner.calls()[0],
        format!(
            "svn checkout svn://gcc.gnu.org/svn/gcc/tags/gcc_8_2_0_release {}",
            src.display()
        )
    );
    assert!(transport.probed.lock().unwrap().is_empty());
}

#[test]
fn download_only_keeps_workspace_and_never_configures() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args();
    args.download_only = true;
    let req = request(tmp.path(), args);
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[("tar.xz", true)]));

    let (res, sink) = run(&req, runner.clone(), transport);
    res.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls.iter().any(|c| c.contains("configure") || c.contains("make")));
    assert_eq!(sink.usage_lines().len(), 1);

    let root = sink.workspace_root().unwrap();
    assert!(root.join("src").join("configure").is_file());
    assert!(root.join("archive").join("gcc-8.2.0.tar.xz").is_file());
}

#[test]
fn failing_patch_stops_the_run_and_keeps_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args();
    args.patches = vec![
        PathBuf::from("/patches/01-first.patch"),
        PathBuf::from("/patches/02-broken.patch"),
        PathBuf::from("/patches/03-never.patch"),
    ];
    let req = request(tmp.path(), args);
    let runner = Arc::new(RecordingRunner::failing_on("02-broken"));
    let transport = Arc::new(ScriptedTransport::new(&[("tar.xz", true)]));

    let (res, sink) = run(&req, runner.clone(), transport);
    let err = res.unwrap_err().to_string();
    assert!(err.starts_with("task 'patch.apply' failed: apply /patches/02-broken.patch"), "{err}");

    let calls = runner.calls();
    assert!(calls.iter().any(|c| c.contains("01-first")));
    assert!(!calls.iter().any(|c| c.contains("03-never")));
    assert!(!calls.iter().any(|c| c.contains("configure")));
    assert!(sink.workspace_root().unwrap().is_dir());
}

#[test]
fn no_valid_archive_leaves_only_the_empty_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let req = request(tmp.path(), base_args());
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[]));

    let (res, sink) = run(&req, runner.clone(), transport.clone());
    let err = res.unwrap_err().to_string();
    assert_eq!(err, "task 'source.fetch' failed: no archive found");

    assert_eq!(transport.probed.lock().unwrap().len(), 3);
    assert!(transport.downloaded.lock().unwrap().is_empty());
    assert!(runner.calls().is_empty());

    let root = sink.workspace_root().unwrap();
    for sub in ["src", "build", "archive"] {
        assert!(dir_entries(&root.join(sub)).is_empty(), "{sub} should be empty");
    }
}

#[test]
fn build_failure_keeps_workspace_and_skips_report() {
    let tmp = tempfile::tempdir().unwrap();
    let req = request(tmp.path(), base_args());
    let runner = Arc::new(RecordingRunner::failing_on("make -j4"));
    let transport = Arc::new(ScriptedTransport::new(&[("tar.bz2", true)]));

    let (res, sink) = run(&req, runner.clone(), transport);
    assert!(res.unwrap_err().to_string().starts_with("task 'toolchain.compile' failed"));
    assert!(!runner.calls().iter().any(|c| c.contains("make install")));
    assert_eq!(sink.usage_lines().len(), 1);
    assert!(sink.workspace_root().unwrap().join("src").is_dir());
}

#[test]
fn dry_run_walks_the_plan_without_side_effects() {
    let tmp = tempfile::tempdir().unwrap();
    let req = request(tmp.path(), base_args());
    let runner = Arc::new(RecordingRunner::default());
    let transport = Arc::new(ScriptedTransport::new(&[("tar.xz", true)]));

    let (res, sink) = run_with(true, &req, runner.clone(), transport.clone());
    res.unwrap();

    let dry_lines: Vec<String> = sink
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecEvent::TaskLog { line, .. } if line.starts_with("DRY-RUN: exec ") => {
                Some(line.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(dry_lines.len(), 9);
    assert!(runner.calls().is_empty());
    assert!(transport.probed.lock().unwrap().is_empty());
    assert!(sink.workspace_root().is_none());
    assert!(dir_entries(tmp.path()).is_empty());
}
