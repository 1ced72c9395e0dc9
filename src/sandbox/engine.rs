//! sandbox/engine.rs
//!
//! Container engine seam. `DockerCli` drives the docker (or podman) CLI.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::SandboxError;

const CLI_TIMEOUT: Duration = Duration::from_secs(60);
const PIDS_LIMIT: &str = "256";
const MEMORY_LIMIT: &str = "1g";

#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub workdir: String,
    pub network_disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(self.stderr.trim_end());
        }
        text
    }
}

pub trait ContainerEngine: Send + Sync {
    /// Fails with `EnvironmentUnavailable` when the engine cannot be reached.
    fn ping(&self) -> Result<(), SandboxError>;
    fn image_exists(&self, image: &str) -> Result<bool, SandboxError>;
    fn container_exists(&self, name: &str) -> Result<bool, SandboxError>;
    /// Creates and starts a long-lived container.
    fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError>;
    fn exec(&self, container: &str, argv: &[String], timeout: Duration) -> Result<ExecOutput, SandboxError>;
    fn copy_in(&self, container: &str, contents: &[u8], dest: &str) -> Result<(), SandboxError>;
    /// Force-removes the container. Removing a missing container is not an error.
    fn remove(&self, container: &str) -> Result<(), SandboxError>;
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn cli(&self, args: &[String], timeout: Duration) -> Result<ExecOutput, SandboxError> {
        debug!(binary = %self.binary, ?args, "container cli");
        run_with_timeout(Command::new(&self.binary).args(args), timeout).map_err(|e| {
            SandboxError::EnvironmentUnavailable(format!("failed to invoke `{}`: {e}", self.binary))
        })
    }
}

/// Arguments for `docker run`: project mounts keep their read-only flag,
/// networking is off and the entrypoint just idles.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--name".into(),
        spec.name.clone(),
        "--pids-limit".into(),
        PIDS_LIMIT.into(),
        "--memory".into(),
        MEMORY_LIMIT.into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
    ];

    if spec.network_disabled {
        args.push("--network".into());
        args.push("none".into());
    }

    for m in &spec.mounts {
        let mut v = format!("{}:{}", m.host.display(), m.container);
        if m.read_only {
            v.push_str(":ro");
        }
        args.push("--volume".into());
        args.push(v);
    }

    args.extend([
        "--workdir".into(),
        spec.workdir.clone(),
        "--entrypoint".into(),
        "sleep".into(),
        spec.image.clone(),
        "infinity".into(),
    ]);
    args
}

impl ContainerEngine for DockerCli {
    fn ping(&self) -> Result<(), SandboxError> {
        let out = self.cli(
            &["version".into(), "--format".into(), "{{.Server.Version}}".into()],
            CLI_TIMEOUT,
        )?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::EnvironmentUnavailable(format!(
                "container engine not reachable: {}",
                out.combined()
            )))
        }
    }

    fn image_exists(&self, image: &str) -> Result<bool, SandboxError> {
        let out = self.cli(&["image".into(), "inspect".into(), image.into()], CLI_TIMEOUT)?;
        Ok(out.success())
    }

    fn container_exists(&self, name: &str) -> Result<bool, SandboxError> {
        let out = self.cli(&["container".into(), "inspect".into(), name.into()], CLI_TIMEOUT)?;
        Ok(out.success())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        let out = self.cli(&create_args(spec), CLI_TIMEOUT)?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::EnvironmentUnavailable(format!(
                "container failed to start: {}",
                out.combined()
            )))
        }
    }

    fn exec(&self, container: &str, argv: &[String], timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let mut args: Vec<String> = vec!["exec".into(), container.into()];
        args.extend(argv.iter().cloned());
        self.cli(&args, timeout)
    }

    fn copy_in(&self, container: &str, contents: &[u8], dest: &str) -> Result<(), SandboxError> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        // `docker cp` keeps the 0600 temp-file mode; the image runs as an unprivileged user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }

        let out = self.cli(
            &[
                "cp".into(),
                tmp.path().display().to_string(),
                format!("{container}:{dest}"),
            ],
            CLI_TIMEOUT,
        )?;

        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::ExecutionError {
                exit_code: out.exit_code,
                message: format!("copy into container failed: {}", out.combined()),
            })
        }
    }

    fn remove(&self, container: &str) -> Result<(), SandboxError> {
        let out = self.cli(&["rm".into(), "--force".into(), container.into()], CLI_TIMEOUT)?;
        if out.success() || out.stderr.contains("No such container") {
            return Ok(());
        }
        warn!(container, output = %out.combined(), "container removal failed");
        Err(SandboxError::EnvironmentUnavailable(format!(
            "failed to remove container {container}: {}",
            out.combined()
        )))
    }
}

/// Spawns, drains both pipes on helper threads and kills the child once
/// `timeout` elapses.
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> std::io::Result<ExecOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut s) = stdout {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut s) = stderr {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(ExecOutput {
        exit_code: status.and_then(|s| s.code()),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "testsmith".into(),
            image: "python:3.11".into(),
            mounts: vec![Mount {
                host: PathBuf::from("/home/me/project"),
                container: "/mnt/project".into(),
                read_only: true,
            }],
            workdir: "/testsmith".into(),
            network_disabled: true,
        }
    }

    #[test]
    fn project_is_mounted_read_only() {
        let args = create_args(&spec());
        let pos = args.iter().position(|a| a == "--volume").unwrap();
        assert_eq!(args[pos + 1], "/home/me/project:/mnt/project:ro");
    }

    #[test]
    fn network_is_disabled_and_image_precedes_command() {
        let args = create_args(&spec());
        assert!(args.windows(2).any(|w| w[0] == "--network" && w[1] == "none"));
        assert_eq!(&args[args.len() - 2..], &["python:3.11".to_string(), "infinity".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn slow_commands_are_killed() {
        let out = run_with_timeout(
            Command::new("sh").arg("-c").arg("sleep 5"),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[test]
    fn output_is_captured() {
        let out = run_with_timeout(
            Command::new("sh").arg("-c").arg("echo hi; echo oops 1>&2; exit 3"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.combined(), "hi\noops");
    }

    #[test]
    fn missing_binary_is_environment_unavailable() {
        let cli = DockerCli::new("definitely-not-a-container-engine");
        assert!(matches!(cli.ping(), Err(SandboxError::EnvironmentUnavailable(_))));
    }
}
