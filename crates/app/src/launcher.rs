use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::client::WorkerClient;
use crate::config::{LaunchConfig, LauncherKind};
use crate::{WorkerHandle, WorkerLauncher};

pub fn build_launcher(config: &LaunchConfig) -> Result<Arc<dyn WorkerLauncher>, String> {
    let worker_bin = resolve_worker_bin()?;
    Ok(match config.kind {
        LauncherKind::Local => Arc::new(LocalLauncher {
            worker_bin,
            python_bin: config.python_bin.clone(),
        }),
        LauncherKind::Docker => Arc::new(DockerLauncher {
            worker_bin,
            config: config.clone(),
        }),
    })
}

/// Starts workers as plain child processes of the server.
struct LocalLauncher {
    worker_bin: PathBuf,
    python_bin: String,
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self) -> Result<Box<dyn WorkerHandle>, String> {
        let mut command = Command::new(&self.worker_bin);
        command.env("PYTHON_BIN", &self.python_bin);
        spawn_worker(command, "sandbox worker").await
    }
}

/// Starts each worker in its own container under an isolating runtime.
struct DockerLauncher {
    worker_bin: PathBuf,
    config: LaunchConfig,
}

#[async_trait]
impl WorkerLauncher for DockerLauncher {
    async fn launch(&self) -> Result<Box<dyn WorkerHandle>, String> {
        let mut command = Command::new("docker");
        command.args(docker_args(&self.worker_bin, &self.config));
        spawn_worker(command, "sandbox docker container").await
    }
}

fn docker_args(worker_bin: &Path, config: &LaunchConfig) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "--rm".to_owned(),
        "-i".to_owned(),
        format!("--runtime={}", config.docker_runtime),
        "-v".to_owned(),
        format!("{}:/sandbox_worker:ro", worker_bin.display()),
        "-e".to_owned(),
        format!("PYTHON_BIN={}", config.python_bin),
    ];
    if let Ok(filter) = env::var("RUST_LOG") {
        args.push("-e".to_owned());
        args.push(format!("RUST_LOG={filter}"));
    }
    args.push(config.docker_image.clone());
    args.push("/sandbox_worker".to_owned());
    args
}

async fn spawn_worker(mut command: Command, what: &str) -> Result<Box<dyn WorkerHandle>, String> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|err| format!("failed to spawn {what}: {err}"))?;
    let mut client = WorkerClient::new(child)?;
    client.ping().await?;
    tracing::debug!(worker = %client.identifier(), "{what} ready");
    Ok(Box::new(client))
}

fn resolve_worker_bin() -> Result<PathBuf, String> {
    let current =
        env::current_exe().map_err(|err| format!("failed to resolve current executable: {err}"))?;
    let mut worker = current
        .parent()
        .ok_or_else(|| "failed to resolve executable directory".to_owned())?
        .to_path_buf();
    worker.push("sandbox_worker");
    if let Some(ext) = current.extension() {
        worker.set_extension(ext);
    }
    if !worker.exists() {
        return Err(format!(
            "sandbox worker binary not found at {}. Build it with `cargo build -p app --bin sandbox_worker`",
            worker.display()
        ));
    }
    Ok(worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_args_mount_the_worker_under_the_configured_runtime() {
        let config = LaunchConfig {
            kind: LauncherKind::Docker,
            python_bin: "python3".to_owned(),
            docker_runtime: "runsc".to_owned(),
            docker_image: "rust:latest".to_owned(),
        };
        let args = docker_args(Path::new("/opt/bin/sandbox_worker"), &config);

        assert_eq!(&args[..3], ["run", "--rm", "-i"]);
        assert!(args.contains(&"--runtime=runsc".to_owned()));
        assert!(args.contains(&"/opt/bin/sandbox_worker:/sandbox_worker:ro".to_owned()));
        assert_eq!(
            args[args.len() - 2..],
            ["rust:latest".to_owned(), "/sandbox_worker".to_owned()]
        );
    }
}
