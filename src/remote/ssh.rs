// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! ssh session backed by the system OpenSSH client
//!
//! The first command authenticates and leaves a multiplexing master behind
//! (ControlMaster), so every later command and transfer of the task reuses
//! the same authenticated connection. Password auth goes through `sshpass -e`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommandOutput, Connector, RemoteFileReader, RemoteFileWriter, RemoteShell, shell_quote};
use crate::config::SshConfig;
use crate::error::{Error, Result};

/// Idle time before the master connection exits on its own
const CONTROL_PERSIST_SECS: u64 = 600;

pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteShell>> {
        let session = SshSession::open(config).await?;
        Ok(Arc::new(session))
    }
}

pub struct SshSession {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key_file: Option<PathBuf>,
    connect_timeout: Duration,
    control_path: PathBuf,
}

impl SshSession {
    /// Authenticate and start the master connection
    pub async fn open(config: &SshConfig) -> Result<Self> {
        let session = Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone().filter(|p| !p.is_empty()),
            key_file: config.key_file.clone(),
            connect_timeout: config.connect_timeout(),
            control_path: std::env::temp_dir()
                .join(format!("wolfbackup-{}.ssh", &Uuid::new_v4().simple().to_string()[..12])),
        };

        info!("Connecting to {}@{}:{}", session.username, session.host, session.port);
        let mut probe = session.command("true");
        // Allow for sshpass and the TCP connect on top of the handshake
        let output = tokio::time::timeout(session.connect_timeout * 2, probe.output())
            .await
            .map_err(|_| Error::Connection(format!(
                "timed out after {}s connecting to {}", session.connect_timeout.as_secs() * 2, session.host
            )))?
            .map_err(|e| Error::Connection(format!("failed to launch ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Connection(if stderr.is_empty() {
                format!("ssh exited with {}", output.status)
            } else {
                stderr
            }));
        }
        debug!("ssh master established at {}", session.control_path.display());
        Ok(session)
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = match (&self.key_file, &self.password) {
            (None, Some(password)) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg("ssh").env("SSHPASS", password);
                c
            }
            _ => Command::new("ssh"),
        };
        cmd.arg("-p").arg(self.port.to_string());
        for opt in [
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "ServerAliveInterval=30".to_string(),
            "ServerAliveCountMax=6".to_string(),
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            format!("ControlPersist={}", CONTROL_PERSIST_SECS),
        ] {
            cmd.arg("-o").arg(opt);
        }
        match &self.key_file {
            Some(key) => {
                cmd.arg("-i").arg(key).args(["-o", "BatchMode=yes"]);
            }
            None => {
                cmd.args(["-o", "PubkeyAuthentication=no", "-o", "NumberOfPasswordPrompts=1"]);
            }
        }
        cmd.arg(format!("{}@{}", self.username, self.host));
        cmd.arg(remote);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn(&self, remote: &str, stdin: Stdio) -> Result<Child> {
        let mut cmd = self.command(remote);
        cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.spawn().map_err(|e| Error::Connection(format!("failed to launch ssh: {}", e)))
    }
}

/// Drain a child's stderr in the background so it can never block the child
fn collect_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        match stderr {
            Some(stderr) => read_lossy(stderr).await,
            None => String::new(),
        }
    })
}

/// Everything the reader yields, invalid UTF-8 replaced rather than rejected
async fn read_lossy<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("stderr read stopped early: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Hand each line to `on_line` without its terminator. Tar echoes raw
/// filename bytes, so lines are decoded lossily.
async fn stream_lines<R: AsyncBufRead + Unpin>(
    mut reader: R,
    on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        on_line(line.trim_end_matches(['\n', '\r']));
    }
}

async fn finish_child(mut child: Child, stderr: tokio::task::JoinHandle<String>) -> Result<CommandOutput> {
    let status = child.wait().await?;
    let stderr = stderr.await.unwrap_or_default();
    Ok(CommandOutput {
        stdout: String::new(),
        stderr,
        // Killed by a signal: no code
        exit_code: status.code().unwrap_or(-1),
    })
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        debug!("ssh exec: {}", command);
        let output = self.command(command)
            .output()
            .await
            .map_err(|e| Error::Connection(format!("failed to launch ssh: {}", e)))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<CommandOutput> {
        debug!("ssh exec (streaming): {}", command);
        let mut child = self.spawn(command, Stdio::null())?;
        let stderr = collect_stderr(&mut child);
        if let Some(stdout) = child.stdout.take() {
            stream_lines(BufReader::new(stdout), on_line).await?;
        }
        finish_child(child, stderr).await
    }

    async fn open_read(&self, path: &str) -> Result<(u64, Box<dyn RemoteFileReader>)> {
        let stat = self.exec(&format!("stat -c %s -- {}", shell_quote(path))).await?.check()?;
        let size = stat.stdout.trim().parse::<u64>()
            .map_err(|_| Error::transfer(format!("unexpected stat output for {}: {}", path, stat.stdout.trim())))?;

        let mut child = self.spawn(&format!("cat -- {}", shell_quote(path)), Stdio::null())?;
        let stderr = collect_stderr(&mut child);
        let stdout = child.stdout.take()
            .ok_or_else(|| Error::transfer("ssh stdout unavailable"))?;
        Ok((size, Box::new(SshFileReader { child, stdout, stderr })))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFileWriter>> {
        let parent = match path.rfind('/') {
            Some(0) => "/",
            Some(i) => &path[..i],
            None => ".",
        };
        let remote = format!("mkdir -p -- {} && cat > {}", shell_quote(parent), shell_quote(path));
        let mut child = self.spawn(&remote, Stdio::piped())?;
        let stderr = collect_stderr(&mut child);
        let stdin = child.stdin.take()
            .ok_or_else(|| Error::transfer("ssh stdin unavailable"))?;
        Ok(Box::new(SshFileWriter { child, stdin: Some(stdin), stderr }))
    }

    async fn close(&self) {
        let result = Command::new("ssh")
            .arg("-o").arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(format!("{}@{}", self.username, self.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!("Failed to stop ssh master for {}: {}", self.host, e);
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
    }
}

struct SshFileReader {
    child: Child,
    stdout: ChildStdout,
    stderr: tokio::task::JoinHandle<String>,
}

#[async_trait]
impl RemoteFileReader for SshFileReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stdout.read(buf).await?)
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let SshFileReader { child, stdout, stderr } = *self;
        drop(stdout);
        finish_child(child, stderr).await?.check().map(|_| ())
    }
}

struct SshFileWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: tokio::task::JoinHandle<String>,
}

#[async_trait]
impl RemoteFileWriter for SshFileWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut()
            .ok_or_else(|| Error::transfer("remote file already closed"))?;
        stdin.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        let SshFileWriter { child, stderr, .. } = *self;
        finish_child(child, stderr).await?.check().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_the_stream() {
        let output: &[u8] = b"INFO: starting new backup job\n\
            INFO: tar: ./srv/caf\xe9.txt: file changed as we read it\r\n\
            INFO: creating vzdump archive '/dump/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst'\n\
            INFO: Finished Backup of VM 101";
        let mut lines = Vec::new();
        let mut on_line = |line: &str| lines.push(line.to_string());

        stream_lines(output, &mut on_line).await.unwrap();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "INFO: tar: ./srv/caf\u{fffd}.txt: file changed as we read it");
        let archives: Vec<String> = lines.iter()
            .filter_map(|l| crate::archive::archive_path_from_line(l))
            .collect();
        assert_eq!(archives, vec!["/dump/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst"]);
        assert_eq!(lines[3], "INFO: Finished Backup of VM 101");
    }

    #[tokio::test]
    async fn test_stderr_with_invalid_utf8_is_kept() {
        let stderr: &[u8] = b"tar: caf\xe9\nERROR: unexpected control message\n";
        let text = read_lossy(stderr).await;
        assert!(text.contains("unexpected control message"));
        assert!(matches!(
            crate::remote::classify_failure(1, "", &text),
            Error::Interrupted(_)
        ));
    }
}
