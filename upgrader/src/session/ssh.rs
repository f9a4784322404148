//! OpenSSH-backed device sessions
//!
//! `connect` starts a multiplexing master (`ssh -M -N -f -S <socket>`); every
//! command, upload and config replay then rides the control socket, so the
//! device only authenticates once per session. `disconnect` stops the master.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::UpgradeError;
use crate::models::device::Device;
use crate::models::request::remote_file_path;
use crate::session::{CommandResult, Connector, DeviceSession, RemoteFile};
use crate::utils::sanitize_file_component;

/// Slack on top of `ConnectTimeout` before the master process is killed
const CONNECT_MARGIN: Duration = Duration::from_secs(2);

/// Options for OpenSSH sessions
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// `ssh` binary
    pub ssh_program: PathBuf,

    /// SSH port
    pub port: u16,

    /// Private key passed with `-i`
    pub identity_file: Option<PathBuf>,

    /// Value for `StrictHostKeyChecking`
    pub strict_host_key_checking: String,

    /// Directory holding control sockets and master logs
    pub control_dir: PathBuf,

    /// Upper bound for a single command or upload
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            port: 22,
            identity_file: None,
            strict_host_key_checking: "accept-new".to_string(),
            control_dir: std::env::temp_dir().join("switch-upgrade"),
            command_timeout: Duration::from_secs(1800),
        }
    }
}

/// Opens [`SshSession`]s using the system `ssh`/`scp` binaries
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        device: &Device,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceSession>, UpgradeError> {
        tokio::fs::create_dir_all(&self.options.control_dir).await?;

        let stem = format!(
            "{}-{}",
            sanitize_file_component(&device.hostname),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let socket = self.options.control_dir.join(format!("{}.sock", stem));
        let master_log = self.options.control_dir.join(format!("{}.log", stem));

        let mut cmd = match &device.credentials.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e")
                    .arg(&self.options.ssh_program)
                    .env("SSHPASS", password.expose_secret());
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.options.ssh_program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args(["-M", "-N", "-f"])
            .arg("-S")
            .arg(&socket)
            .arg("-E")
            .arg(&master_log)
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                self.options.strict_host_key_checking
            ))
            .arg("-p")
            .arg(self.options.port.to_string())
            .arg("-l")
            .arg(&device.credentials.username);
        if let Some(identity) = &self.options.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(&device.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!("Opening SSH master to {} ({})", device.hostname, device.address);

        // The backgrounded master keeps running after this process exits
        let status = match tokio::time::timeout(timeout + CONNECT_MARGIN, cmd.status()).await {
            Ok(status) => {
                status.map_err(|e| UpgradeError::Connect(format!("failed to spawn ssh: {}", e)))?
            }
            Err(_) => {
                // A master may have come up just as the client was killed
                let exit = exit_master_command(&self.options.ssh_program, &socket, &device.address);
                let _ = Command::from(exit).status().await;
                let _ = tokio::fs::remove_file(&socket).await;
                let _ = tokio::fs::remove_file(&master_log).await;
                return Err(UpgradeError::Connect(format!(
                    "timed out after {:?} connecting to {}",
                    timeout, device.hostname
                )));
            }
        };

        if !status.success() {
            let detail = tokio::fs::read_to_string(&master_log)
                .await
                .unwrap_or_default();
            let _ = tokio::fs::remove_file(&master_log).await;
            return Err(UpgradeError::Connect(format!(
                "ssh to {} exited with {}: {}",
                device.hostname,
                status,
                detail.trim()
            )));
        }

        info!("Successfully connected to {}", device.hostname);
        Ok(Box::new(SshSession {
            ssh_program: self.options.ssh_program.clone(),
            hostname: device.hostname.clone(),
            address: device.address.clone(),
            username: device.credentials.username.clone(),
            port: self.options.port,
            socket,
            master_log,
            command_timeout: self.options.command_timeout,
            open: true,
        }))
    }
}

/// A session multiplexed over an OpenSSH control socket
pub struct SshSession {
    ssh_program: PathBuf,
    hostname: String,
    address: String,
    username: String,
    port: u16,
    socket: PathBuf,
    master_log: PathBuf,
    command_timeout: Duration,
    open: bool,
}

/// `ssh -O exit` for the master behind `socket`
fn exit_master_command(program: &Path, socket: &Path, address: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.arg("-S")
        .arg(socket)
        .args(["-O", "exit"])
        .arg(address)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

impl SshSession {
    /// Client command over the control socket. `tty` forces a pseudo-terminal
    /// so the device runs an interactive shell fed from stdin.
    fn ssh(&self, tty: bool) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.socket)
            .args(["-o", "ControlMaster=no"])
            .arg(if tty { "-tt" } else { "-T" })
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-l")
            .arg(&self.username)
            .arg(&self.address);
        cmd
    }

    async fn collect(&self, mut cmd: Command, stdin: Option<&str>) -> CommandResult {
        if !self.open {
            return CommandResult::failed("", "session is closed");
        }

        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let exchange = async {
            let mut child = cmd.spawn()?;
            if let (Some(script), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(script.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.command_timeout, exchange).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    CommandResult::ok(stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    CommandResult::failed(stdout, format!("exit {}: {}", output.status, stderr))
                }
            }
            Ok(Err(e)) => CommandResult::failed("", format!("failed to run ssh: {}", e)),
            Err(_) => CommandResult::failed(
                "",
                format!("no response within {:?}", self.command_timeout),
            ),
        }
    }
}

#[async_trait]
impl DeviceSession for SshSession {
    async fn run(&mut self, command: &str) -> CommandResult {
        debug!("[{}] $ {}", self.hostname, command);
        let mut cmd = self.ssh(false);
        cmd.arg(command);
        self.collect(cmd, None).await
    }

    async fn upload(&mut self, local: &Path, remote_path: &str) -> Result<RemoteFile, UpgradeError> {
        let remote = remote_file_path(remote_path, local);
        info!("Uploading {} to {}:{}", local.display(), self.hostname, remote);

        let mut cmd = Command::new("scp");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.socket.display()))
            .arg("-P")
            .arg(self.port.to_string())
            .arg(local)
            .arg(format!("{}@{}:{}", self.username, self.address, remote));

        let result = self.collect(cmd, None).await;
        if result.success {
            Ok(RemoteFile { path: remote })
        } else {
            Err(UpgradeError::Transfer(
                result.error.unwrap_or_else(|| "scp failed".to_string()),
            ))
        }
    }

    async fn apply_config(&mut self, script: &str) -> CommandResult {
        debug!("[{}] replaying {} config lines", self.hostname, script.lines().count());
        let cmd = self.ssh(true);
        self.collect(cmd, Some(script)).await
    }

    async fn disconnect(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let exit = exit_master_command(&self.ssh_program, &self.socket, &self.address);
        let status = Command::from(exit).status().await;

        match status {
            Ok(s) if s.success() => debug!("Closed SSH master to {}", self.hostname),
            Ok(s) => warn!("SSH master to {} did not exit cleanly: {}", self.hostname, s),
            Err(e) => warn!("Failed to stop SSH master to {}: {}", self.hostname, e),
        }

        let _ = tokio::fs::remove_file(&self.socket).await;
        let _ = tokio::fs::remove_file(&self.master_log).await;
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        warn!("SSH session to {} dropped while open, stopping its master", self.hostname);
        let _ = exit_master_command(&self.ssh_program, &self.socket, &self.address).status();
        let _ = std::fs::remove_file(&self.socket);
        let _ = std::fs::remove_file(&self.master_log);
    }
}
