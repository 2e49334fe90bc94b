// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Remote execution on the Proxmox host
//!
//! A `Connector` opens a `RemoteShell` session; the session runs commands
//! (buffered or line-streamed) and moves file contents in chunks. The ssh
//! implementation lives in `ssh`; tests substitute in-memory shells.

pub mod ssh;

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::config::SshConfig;
use crate::error::{Error, Result};

pub use ssh::SshConnector;

/// Stderr/stdout signatures of a disrupted control channel rather than a failed command
pub const INTERRUPTED_PATTERN: &str = concat!(
    r"(?i)unexpected control message",
    r"|interrupted by signal",
    r"|received signal",
    r"|connection to \S+ closed by remote host",
    r"|broken pipe",
);

static INTERRUPTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(INTERRUPTED_PATTERN).expect("interrupted pattern"));

/// ssh reserves 255 for its own failures
pub const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into the matching error
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(classify_failure(self.exit_code, &self.stdout, &self.stderr))
        }
    }
}

/// Decide between "the command failed" and "the session was disrupted"
pub fn classify_failure(exit_code: i32, stdout: &str, stderr: &str) -> Error {
    let signature = INTERRUPTED_RE
        .find(stderr)
        .or_else(|| INTERRUPTED_RE.find(stdout))
        .map(|m| m.as_str().to_string());
    if let Some(sig) = signature {
        let detail = last_meaningful_line(stderr).unwrap_or(sig);
        return Error::Interrupted(format!("{} (exit {})", detail, exit_code));
    }
    if exit_code == SSH_TRANSPORT_EXIT {
        let detail = last_meaningful_line(stderr)
            .unwrap_or_else(|| "ssh exited without a diagnostic".to_string());
        return Error::Connection(detail);
    }
    let stderr = last_meaningful_line(stderr)
        .or_else(|| last_meaningful_line(stdout))
        .unwrap_or_else(|| "no diagnostic output".to_string());
    Error::Command { code: exit_code, stderr }
}

fn last_meaningful_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

/// Quote a value for a POSIX shell on the remote side
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Chunked read of one remote file
#[async_trait]
pub trait RemoteFileReader: Send {
    /// Fill `buf`, returning 0 at end of file
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Confirm the remote side finished cleanly
    async fn finish(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait RemoteFileWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;
    async fn finish(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run to completion, buffering all output
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Run to completion, handing each stdout line to `on_line` as it arrives.
    /// The returned output carries stderr and the exit code; stdout is not buffered.
    async fn exec_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<CommandOutput>;

    /// Open a remote file for reading, returning its size
    async fn open_read(&self, path: &str) -> Result<(u64, Box<dyn RemoteFileReader>)>;

    /// Create (or truncate) a remote file, creating parent directories
    async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFileWriter>>;

    /// Tear down the session; further calls may fail
    async fn close(&self) {}
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteShell>>;
}

#[cfg(test)]
pub mod fake {
    //! In-memory host used by the module tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Responder = Box<dyn Fn(&str) -> Option<(Vec<String>, String, i32)> + Send + Sync>;

    /// Scripted shell: each command is matched against responders in order;
    /// unmatched commands succeed with no output
    #[derive(Default)]
    pub struct FakeShell {
        responders: Mutex<Vec<Responder>>,
        pub commands: Mutex<Vec<String>>,
        pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub gate: Option<Arc<tokio::sync::Notify>>,
        write_failures: AtomicUsize,
    }

    impl FakeShell {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond to commands containing `needle` with stdout lines, stderr and exit code
        pub fn on(self, needle: &str, stdout: &[&str], stderr: &str, code: i32) -> Self {
            let needle = needle.to_string();
            let lines: Vec<String> = stdout.iter().map(|s| s.to_string()).collect();
            let stderr = stderr.to_string();
            self.responders.lock().unwrap().push(Box::new(move |cmd: &str| {
                cmd.contains(&needle).then(|| (lines.clone(), stderr.clone(), code))
            }));
            self
        }

        pub fn with_file(self, path: &str, data: &[u8]) -> Self {
            self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
            self
        }

        /// Block streaming commands until the notify fires
        pub fn gated(mut self, gate: Arc<tokio::sync::Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        /// The next `n` remote writes fail as if the session dropped mid-upload
        pub fn failing_writes(self, n: usize) -> Self {
            self.write_failures.store(n, Ordering::SeqCst);
            self
        }

        pub fn ran(&self, needle: &str) -> usize {
            self.commands.lock().unwrap().iter().filter(|c| c.contains(needle)).count()
        }

        pub fn command_count(&self) -> usize {
            self.commands.lock().unwrap().len()
        }

        fn respond(&self, command: &str) -> (Vec<String>, String, i32) {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(rest) = command.strip_prefix("rm -f ") {
                for path in rest.split_whitespace() {
                    self.files.lock().unwrap().remove(path.trim_matches('\''));
                }
            }
            let responders = self.responders.lock().unwrap();
            responders
                .iter()
                .find_map(|r| r(command))
                .unwrap_or_else(|| (Vec::new(), String::new(), 0))
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, command: &str) -> Result<CommandOutput> {
            let (lines, stderr, exit_code) = self.respond(command);
            Ok(CommandOutput { stdout: lines.join("\n"), stderr, exit_code })
        }

        async fn exec_streaming(
            &self,
            command: &str,
            on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        ) -> Result<CommandOutput> {
            let (lines, stderr, exit_code) = self.respond(command);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            for line in &lines {
                on_line(line);
            }
            Ok(CommandOutput { stdout: String::new(), stderr, exit_code })
        }

        async fn open_read(&self, path: &str) -> Result<(u64, Box<dyn RemoteFileReader>)> {
            self.commands.lock().unwrap().push(format!("read {}", path));
            let data = self.files.lock().unwrap().get(path).cloned()
                .ok_or_else(|| Error::Command { code: 1, stderr: format!("{}: No such file", path) })?;
            Ok((data.len() as u64, Box::new(FakeReader { data, pos: 0 })))
        }

        async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFileWriter>> {
            self.commands.lock().unwrap().push(format!("write {}", path));
            let failing = self.write_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::transfer(format!("write to {} interrupted", path)));
            }
            Ok(Box::new(FakeWriter { files: self.files.clone(), path: path.to_string(), data: Vec::new() }))
        }
    }

    struct FakeReader {
        data: Vec<u8>,
        pos: usize,
    }

    #[async_trait]
    impl RemoteFileReader for FakeReader {
        async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        async fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct FakeWriter {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        path: String,
        data: Vec<u8>,
    }

    #[async_trait]
    impl RemoteFileWriter for FakeWriter {
        async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<()> {
            self.files.lock().unwrap().insert(self.path.clone(), self.data.clone());
            Ok(())
        }
    }

    /// Hands out the same shell on every connect, optionally failing the first N attempts
    pub struct FakeConnector {
        pub shell: Arc<FakeShell>,
        pub failures: AtomicUsize,
        pub connects: AtomicUsize,
    }

    impl FakeConnector {
        pub fn new(shell: Arc<FakeShell>) -> Self {
            Self { shell, failures: AtomicUsize::new(0), connects: AtomicUsize::new(0) }
        }

        pub fn failing(shell: Arc<FakeShell>, failures: usize) -> Self {
            Self { shell, failures: AtomicUsize::new(failures), connects: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _config: &SshConfig) -> Result<Arc<dyn RemoteShell>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Connection("Connection refused".into()));
            }
            Ok(self.shell.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_is_interrupted() {
        let err = classify_failure(
            1,
            "INFO: status: 40%",
            "ERROR: unexpected control message received\n",
        );
        match err {
            Error::Interrupted(msg) => assert!(msg.contains("unexpected control message")),
            other => panic!("expected Interrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_failure_is_command_error() {
        let err = classify_failure(2, "", "ERROR: Backup of VM 101 failed - storage 'nas' not online\n\n");
        match err {
            Error::Command { code, stderr } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "ERROR: Backup of VM 101 failed - storage 'nas' not online");
            }
            other => panic!("expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_ssh_drop_mid_job_is_interrupted() {
        let err = classify_failure(SSH_TRANSPORT_EXIT, "", "Connection to 10.0.0.5 closed by remote host.");
        assert!(matches!(err, Error::Interrupted(_)));
    }

    #[test]
    fn test_ssh_refusal_is_connection_error() {
        let err = classify_failure(SSH_TRANSPORT_EXIT, "", "ssh: connect to host 10.0.0.5 port 22: Connection refused");
        assert!(matches!(err, Error::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_check_passes_success_through() {
        let out = CommandOutput { stdout: "ok".into(), stderr: String::new(), exit_code: 0 };
        assert_eq!(out.clone().check().unwrap(), out);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/tmp/a b.tar"), "'/var/tmp/a b.tar'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
