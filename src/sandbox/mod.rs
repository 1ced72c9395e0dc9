//! sandbox
//!
//! One long-lived container per application. The project is bind-mounted
//! read-only; every run gets its own scratch directory inside the container.

pub mod engine;
pub mod report;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::state::{ExecutionResult, TargetObject};

pub use engine::{ContainerEngine, ContainerSpec, DockerCli, ExecOutput, Mount};

pub const RUNNER_SCRIPT: &str = include_str!("../../assets/run_tests.py");

const RUNNER_DIR: &str = "/testsmith";
const RUNNER_PATH: &str = "/testsmith/run_tests.py";
const RUNS_DIR: &str = "/testsmith/runs";
const PROJECT_MOUNT: &str = "/mnt/project";
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);
/// Extra host-side slack on top of the in-container `timeout`.
const HOST_GRACE: Duration = Duration::from_secs(15);
const MIN_PYTHON: (u32, u32) = (3, 9);

/// Anything that can execute a candidate test for a target.
pub trait TestExecutor: Send + Sync {
    fn run(&self, test_source: &str, target: &TargetObject) -> Result<ExecutionResult, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub container_name: String,
    pub run_timeout: Duration,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            container_name: "testsmith".into(),
            run_timeout: Duration::from_secs(60),
        }
    }
}

pub struct SandboxSession<E: ContainerEngine = DockerCli> {
    engine: E,
    container: String,
    image: String,
    project_root: PathBuf,
    run_timeout: Duration,
    active: AtomicBool,
}

impl<E: ContainerEngine> SandboxSession<E> {
    /// Creates the container, mounts `project_root` read-only and installs
    /// the runner script.
    pub fn start(
        engine: E,
        project_root: &Path,
        image: &str,
        opts: SandboxOptions,
    ) -> Result<Self, SandboxError> {
        engine.ping()?;

        if !engine.image_exists(image)? {
            return Err(SandboxError::EnvironmentUnavailable(format!(
                "image `{image}` not found; pull or build it first"
            )));
        }

        let project_root = project_root.canonicalize().map_err(|e| {
            SandboxError::EnvironmentUnavailable(format!(
                "project root {} unusable: {e}",
                project_root.display()
            ))
        })?;

        if engine.container_exists(&opts.container_name)? {
            warn!(container = %opts.container_name, "removing stale container");
            engine.remove(&opts.container_name)?;
        }

        let spec = ContainerSpec {
            name: opts.container_name.clone(),
            image: image.to_string(),
            mounts: vec![Mount {
                host: project_root.clone(),
                container: PROJECT_MOUNT.into(),
                read_only: true,
            }],
            workdir: RUNNER_DIR.into(),
            network_disabled: true,
        };
        if let Err(e) = engine.create(&spec) {
            // `docker run` can leave a created-but-dead container behind
            let _ = engine.remove(&spec.name);
            return Err(e);
        }

        let session = Self {
            engine,
            container: opts.container_name,
            image: image.to_string(),
            project_root,
            run_timeout: opts.run_timeout,
            active: AtomicBool::new(true),
        };

        // On failure `session` drops here and the container is removed.
        session.prepare()?;

        info!(
            container = %session.container,
            image = %session.image,
            root = %session.project_root.display(),
            "sandbox ready"
        );
        Ok(session)
    }

    fn prepare(&self) -> Result<(), SandboxError> {
        let version = self.exec_checked(&["python3", "--version"], HOUSEKEEPING_TIMEOUT)?;
        check_python_version(&version.combined())?;

        self.exec_checked(&["mkdir", "-p", RUNS_DIR], HOUSEKEEPING_TIMEOUT)?;
        self.engine
            .copy_in(&self.container, RUNNER_SCRIPT.as_bytes(), RUNNER_PATH)
            .map_err(|e| SandboxError::EnvironmentUnavailable(format!("installing runner: {e}")))
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn mount_point(&self) -> &str {
        PROJECT_MOUNT
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the container. Safe to call any number of times; a failed
    /// removal leaves the session active so the next call tries again.
    pub fn stop(&self) -> Result<(), SandboxError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(container = %self.container, "stopping sandbox");
        let removed = self.engine.remove(&self.container);
        if removed.is_err() {
            // keep the session live so a later stop (or Drop) retries
            self.active.store(true, Ordering::SeqCst);
        }
        removed
    }

    fn exec_checked(&self, argv: &[&str], timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let out = self.engine.exec(&self.container, &argv, timeout)?;
        if out.success() {
            Ok(out)
        } else {
            Err(SandboxError::ExecutionError {
                exit_code: out.exit_code,
                message: format!("`{}` failed: {}", argv.join(" "), out.combined()),
            })
        }
    }

    fn run_in(&self, workdir: &str, test_source: &str, target: &TargetObject) -> Result<ExecutionResult, SandboxError> {
        self.exec_checked(&["mkdir", "-p", workdir], HOUSEKEEPING_TIMEOUT)?;
        self.engine.copy_in(
            &self.container,
            test_source.as_bytes(),
            &format!("{workdir}/test_source.py"),
        )?;

        let limit = self.run_timeout.as_secs().max(1).to_string();
        let module = target.module_name();
        let argv: Vec<String> = [
            "env",
            "PYTHONDONTWRITEBYTECODE=1",
            "timeout",
            "--kill-after=5",
            limit.as_str(),
            "python3",
            RUNNER_PATH,
            "--project",
            PROJECT_MOUNT,
            "--module",
            module.as_str(),
            "--workdir",
            workdir,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let started = Instant::now();
        let out = self
            .engine
            .exec(&self.container, &argv, self.run_timeout + HOST_GRACE)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        // 124: coreutils timeout fired; 137: killed after the grace period.
        if out.timed_out || matches!(out.exit_code, Some(124) | Some(137)) {
            return Err(SandboxError::ExecutionTimeout {
                limit: self.run_timeout,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        if !out.success() {
            // The runner leaves a provisional report behind when the generated
            // code kills the interpreter; that is a failing candidate, not a crash.
            if let Some(mut report) = self.read_report(workdir).filter(|r| r.is_interrupted()) {
                warn!(exit_code = ?out.exit_code, "test process exited before reporting");
                if let Some(reason) = report.interrupted.as_mut() {
                    reason.push_str(&format!(" (exit code {})", exit_label(out.exit_code)));
                }
                report.stdout.push_str(&out.stdout);
                report.stderr.push_str(&out.stderr);
                return Ok(report.into_result(duration_ms));
            }
            return Err(SandboxError::ExecutionError {
                exit_code: out.exit_code,
                message: out.combined(),
            });
        }

        let raw = self.exec_checked(&["cat", &format!("{workdir}/report.json")], HOUSEKEEPING_TIMEOUT)?;
        let report = report::parse_report(&raw.stdout)?;
        Ok(report.into_result(duration_ms))
    }

    fn read_report(&self, workdir: &str) -> Option<report::RunnerReport> {
        let raw = self
            .exec_checked(&["cat", &format!("{workdir}/report.json")], HOUSEKEEPING_TIMEOUT)
            .ok()?;
        report::parse_report(&raw.stdout).ok()
    }
}

impl<E: ContainerEngine> TestExecutor for SandboxSession<E> {
    fn run(&self, test_source: &str, target: &TargetObject) -> Result<ExecutionResult, SandboxError> {
        if !self.is_active() {
            return Err(SandboxError::Stopped);
        }

        let workdir = format!("{RUNS_DIR}/{}", Uuid::new_v4().simple());
        debug!(%workdir, target = %target.id(), "sandbox run");

        let result = self.run_in(&workdir, test_source, target);

        if let Err(e) = self.exec_checked(&["rm", "-rf", &workdir], HOUSEKEEPING_TIMEOUT) {
            warn!(%workdir, error = %e, "scratch cleanup failed");
        }
        result
    }
}

impl<E: ContainerEngine> Drop for SandboxSession<E> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(container = %self.container, error = %e, "sandbox teardown failed");
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "none, killed by a signal".to_string(), |c| c.to_string())
}

fn check_python_version(output: &str) -> Result<(), SandboxError> {
    let re = Regex::new(r"(\d+)\.(\d+)").expect("static regex");
    let caps = re.captures(output).ok_or_else(|| {
        SandboxError::EnvironmentUnavailable(format!("cannot read python version from `{output}`"))
    })?;

    let major: u32 = caps[1].parse().unwrap_or(0);
    let minor: u32 = caps[2].parse().unwrap_or(0);
    if (major, minor) < MIN_PYTHON {
        return Err(SandboxError::EnvironmentUnavailable(format!(
            "python in the image must be >= {}.{}, found {major}.{minor}",
            MIN_PYTHON.0, MIN_PYTHON.1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::state::LineSpan;

    /// Records calls and replays scripted exec outputs.
    #[derive(Default)]
    struct FakeEngine {
        image_present: bool,
        stale: bool,
        python: String,
        run_outputs: Mutex<VecDeque<ExecOutput>>,
        report: String,
        removed: Mutex<Vec<String>>,
        /// Number of upcoming `remove` calls that fail.
        failing_removes: Mutex<u32>,
        created: Mutex<Vec<ContainerSpec>>,
        copied: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn healthy() -> Self {
            Self {
                image_present: true,
                python: "Python 3.11.4".into(),
                report: r#"{"tests_run": 1, "executed_lines": [1], "missing_lines": []}"#.into(),
                ..Default::default()
            }
        }

        fn ok(stdout: &str) -> ExecOutput {
            ExecOutput {
                exit_code: Some(0),
                stdout: stdout.into(),
                ..Default::default()
            }
        }
    }

    impl ContainerEngine for &FakeEngine {
        fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }
        fn image_exists(&self, _image: &str) -> Result<bool, SandboxError> {
            Ok(self.image_present)
        }
        fn container_exists(&self, _name: &str) -> Result<bool, SandboxError> {
            Ok(self.stale)
        }
        fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
            self.created.lock().unwrap().push(spec.clone());
            Ok(())
        }
        fn exec(&self, _c: &str, argv: &[String], _t: Duration) -> Result<ExecOutput, SandboxError> {
            match argv[0].as_str() {
                "python3" => Ok(FakeEngine::ok(&self.python)),
                "env" => Ok(self
                    .run_outputs
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| FakeEngine::ok(""))),
                "cat" => Ok(FakeEngine::ok(&self.report)),
                _ => Ok(FakeEngine::ok("")),
            }
        }
        fn copy_in(&self, _c: &str, _contents: &[u8], dest: &str) -> Result<(), SandboxError> {
            self.copied.lock().unwrap().push(dest.to_string());
            Ok(())
        }
        fn remove(&self, container: &str) -> Result<(), SandboxError> {
            self.removed.lock().unwrap().push(container.to_string());
            let mut failing = self.failing_removes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(SandboxError::EnvironmentUnavailable("daemon busy".into()));
            }
            Ok(())
        }
    }

    fn target() -> TargetObject {
        TargetObject {
            name: "add".into(),
            class_name: None,
            source_path: PathBuf::from("ops.py"),
            span: LineSpan { start: 1, end: 2 },
            source: "def add(a, b):\n    return a + b".into(),
            info_sheet: Vec::new(),
        }
    }

    fn start(engine: &FakeEngine) -> Result<SandboxSession<&FakeEngine>, SandboxError> {
        SandboxSession::start(engine, Path::new("."), "python:3.11", SandboxOptions::default())
    }

    #[test]
    fn start_mounts_project_read_only_and_installs_runner() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();

        let created = engine.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].mounts.iter().all(|m| m.read_only));
        assert!(created[0].network_disabled);
        assert_eq!(engine.copied.lock().unwrap()[0], RUNNER_PATH);
        drop(created);
        session.stop().unwrap();
    }

    #[test]
    fn missing_image_is_environment_unavailable() {
        let engine = FakeEngine {
            image_present: false,
            ..FakeEngine::healthy()
        };
        assert!(matches!(start(&engine), Err(SandboxError::EnvironmentUnavailable(_))));
        assert!(engine.created.lock().unwrap().is_empty());
    }

    #[test]
    fn old_python_tears_the_container_down() {
        let engine = FakeEngine {
            python: "Python 3.8.10".into(),
            ..FakeEngine::healthy()
        };
        assert!(matches!(start(&engine), Err(SandboxError::EnvironmentUnavailable(_))));
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn stale_container_is_replaced() {
        let engine = FakeEngine {
            stale: true,
            ..FakeEngine::healthy()
        };
        let session = start(&engine).unwrap();
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
        session.stop().unwrap();
        assert_eq!(engine.removed.lock().unwrap().len(), 2);
    }

    #[test]
    fn stop_is_idempotent_and_start_still_works() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        drop(session);
        assert_eq!(engine.removed.lock().unwrap().len(), 1);

        let again = start(&engine).unwrap();
        assert!(again.is_active());
        again.stop().unwrap();
        assert_eq!(engine.removed.lock().unwrap().len(), 2);
    }

    #[test]
    fn failed_removal_is_retried_by_the_next_stop() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();
        *engine.failing_removes.lock().unwrap() = 1;

        assert!(matches!(session.stop(), Err(SandboxError::EnvironmentUnavailable(_))));
        assert!(session.is_active());

        session.stop().unwrap();
        assert!(!session.is_active());
        session.stop().unwrap();
        assert_eq!(engine.removed.lock().unwrap().len(), 2);
    }

    #[test]
    fn drop_retries_after_a_failed_stop() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();
        *engine.failing_removes.lock().unwrap() = 1;

        assert!(session.stop().is_err());
        drop(session);
        assert_eq!(engine.removed.lock().unwrap().len(), 2);
        assert_eq!(*engine.failing_removes.lock().unwrap(), 0);
    }

    #[test]
    fn run_after_stop_is_rejected() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();
        session.stop().unwrap();
        assert!(matches!(session.run("x", &target()), Err(SandboxError::Stopped)));
    }

    #[test]
    fn run_parses_report() {
        let engine = FakeEngine::healthy();
        let session = start(&engine).unwrap();
        let r = session.run("import unittest", &target()).unwrap();
        assert!(r.passed);
        assert!(engine
            .copied
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.starts_with(RUNS_DIR) && d.ends_with("test_source.py")));
    }

    #[test]
    fn timeout_exit_maps_to_execution_timeout() {
        let engine = FakeEngine::healthy();
        engine.run_outputs.lock().unwrap().push_back(ExecOutput {
            exit_code: Some(124),
            ..Default::default()
        });
        let session = start(&engine).unwrap();
        assert!(matches!(
            session.run("while True: pass", &target()),
            Err(SandboxError::ExecutionTimeout { .. })
        ));
    }

    #[test]
    fn runner_crash_is_execution_error() {
        let engine = FakeEngine::healthy();
        engine.run_outputs.lock().unwrap().push_back(ExecOutput {
            exit_code: Some(1),
            stderr: "ModuleNotFoundError: No module named 'coverage'".into(),
            ..Default::default()
        });
        let session = start(&engine).unwrap();
        assert!(matches!(
            session.run("import unittest", &target()),
            Err(SandboxError::ExecutionError { exit_code: Some(1), .. })
        ));
    }

    #[test]
    fn interpreter_exit_during_tests_is_a_failed_result() {
        let engine = FakeEngine {
            report: r#"{"tests_run": 0, "errors": [], "failures": [], "compile_error": null,
                "interrupted": "The test process exited before reporting."}"#
                .into(),
            ..FakeEngine::healthy()
        };
        engine.run_outputs.lock().unwrap().push_back(ExecOutput {
            exit_code: Some(3),
            ..Default::default()
        });
        let session = start(&engine).unwrap();

        let r = session.run("import os; os._exit(3)", &target()).unwrap();
        assert!(!r.passed);
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].test_id, report::INTERRUPTED_TEST_ID);
        assert!(r.failures[0].message.contains("exit code 3"));
    }

    #[test]
    fn python_version_check() {
        assert!(check_python_version("Python 3.9.1").is_ok());
        assert!(check_python_version("Python 3.12.0").is_ok());
        assert!(check_python_version("Python 2.7.18").is_err());
        assert!(check_python_version("command not found").is_err());
    }
}
