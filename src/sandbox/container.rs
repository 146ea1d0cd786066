//! Docker/Podman runtime driven through the CLI.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{ContainerRuntime, RunSpec};
use crate::cmd::Cmd;
use crate::config::RuntimeKind;

const BOX_LABEL: &str = "agentbox";

pub struct CliRuntime {
    program: &'static str,
}

impl CliRuntime {
    pub fn new(kind: RuntimeKind) -> Result<Self> {
        let program = kind.program();
        which::which(program)
            .with_context(|| format!("{} is not installed or not on PATH", program))?;
        Ok(Self { program })
    }

    /// Arguments for `<runtime> run` without the program itself.
    fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            format!("{}={}", BOX_LABEL, spec.name),
        ];

        // Map to the host user so files in mounts are not root-owned
        args.push("--user".to_string());
        args.push(format!(
            "{}:{}",
            nix::unistd::getuid(),
            nix::unistd::getgid()
        ));

        for mount in &spec.mounts {
            let mut value = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target
            );
            if mount.read_only {
                value.push_str(",readonly");
            }
            args.push("--mount".to_string());
            args.push(value);
        }

        args.push("--workdir".to_string());
        args.push(spec.workdir.clone());

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args
    }
}

impl ContainerRuntime for CliRuntime {
    fn image_exists(&self, image: &str) -> Result<bool> {
        Cmd::new(self.program)
            .args(&["image", "inspect", image])
            .run_as_check()
    }

    fn pull(&self, image: &str) -> Result<()> {
        info!(runtime = self.program, image, "container:pulling image");
        Cmd::new(self.program)
            .args(&["pull", image])
            .run()
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }

    fn run(&self, spec: &RunSpec) -> Result<String> {
        let args = Self::run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(runtime = self.program, name = spec.name, "container:run");
        let id = Cmd::new(self.program)
            .args(&arg_refs)
            .run_and_capture_stdout()
            .with_context(|| format!("Failed to start container {}", spec.name))?;
        info!(id, name = spec.name, "container:started");
        Ok(id)
    }

    fn stop(&self, id: &str) -> Result<bool> {
        let stopped = Cmd::new(self.program).args(&["stop", id]).run_as_check()?;
        if !stopped {
            debug!(id, "container:already stopped or missing");
        }
        // Frees the container name for the next start
        let _ = Cmd::new(self.program).args(&["rm", "-f", id]).run_as_check();
        Ok(stopped)
    }

    fn list(&self) -> Result<Vec<String>> {
        let filter = format!("label={}", BOX_LABEL);
        let output = Cmd::new(self.program)
            .args(&["ps", "-q", "--filter", &filter])
            .run_and_capture_stdout()?;
        Ok(output.lines().map(str::to_string).collect())
    }
}
