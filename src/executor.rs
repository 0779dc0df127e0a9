// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! Runs a command sequence on an execution target and reports
//! (ok, stdout, exit status). The local variant is one bash invocation per
//! task; the ssh variant keeps one interactive shell alive for the whole
//! run and frames every command with marker strings.

use std::io::Read;
use std::io::Write;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use retry::delay::Fixed;
use tracing::debug;
use tracing::warn;

use crate::config::Node;
use crate::util::run_bash_command;

const KEY_SSH_ON: &str = "74ffc7c4-a6ad-4315-94cb-59d045a230c0";
const KEY_CMD_ON: &str = "15e6896c-3ea7-42a0-aa32-23e2ab3c0e12";
const KEY_CMD_OFF: &str = "e04a4348-8092-46a6-8e0c-d30d10c86fb3";

const MAX_CONNECTION_TRIES: usize = 10;
const READ_CHUNK_SIZE: usize = 10240;

// Interactive auth would silently park the session on a password prompt.
const COMMON_SSH_OPTIONS: [&str; 2] = ["-o", "BatchMode=yes"];

/// Builds an echo whose typed form never contains the contiguous marker.
/// Each `-` is followed by a backspace and retyped, so the interactive echo
/// of the command line carries `-\x08-` while the executed echo, after
/// readline applied the erasures, prints the clean marker.
fn echo_marker(key: &str) -> String {
    format!(" echo -e \"{}\"", key.replace('-', "-\x08-"))
}

/// Same trick for the closing marker, prefixed with the exit status of the
/// preceding command group on its own line.
fn echo_status_marker(key: &str) -> String {
    format!(" echo -en \"\\n $? {}\"", key.replace('-', "-\x08-"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn first_token(line: &[u8]) -> Option<String> {
    String::from_utf8_lossy(line)
        .split_whitespace()
        .next()
        .map(|t| t.to_string())
}

/// Result of one executor call. `stdout` and `status` are absent when the
/// session died before the command could be framed.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub ok: bool,
    pub stdout: Option<Vec<u8>>,
    pub status: Option<String>,
}
impl ExecOutcome {
    fn session_lost() -> Self {
        ExecOutcome {
            ok: false,
            stdout: None,
            status: None,
        }
    }
}

pub enum Executor {
    Bash(BashExecutor),
    Ssh(SshExecutor),
}
impl Executor {
    /// Picks the executor variant by hostname and brings it up.
    pub fn start(node: &Node) -> Result<Self> {
        if node.is_local() {
            Ok(Executor::Bash(BashExecutor::new()))
        } else {
            Ok(Executor::Ssh(SshExecutor::connect(node)?))
        }
    }
    pub fn is_alive(&self) -> bool {
        match self {
            Executor::Bash(e) => e.is_alive(),
            Executor::Ssh(e) => e.is_alive(),
        }
    }
    pub fn execute(&mut self, initrc: &[String], cmds: &[String]) -> ExecOutcome {
        match self {
            Executor::Bash(e) => e.execute(initrc, cmds),
            Executor::Ssh(e) => e.execute(initrc, cmds),
        }
    }
}

/// Runs each command group as one `bash -c` child with stderr merged into
/// stdout. Always alive.
#[derive(Debug, Default)]
pub struct BashExecutor {}
impl BashExecutor {
    pub fn new() -> Self {
        BashExecutor {}
    }
    pub fn is_alive(&self) -> bool {
        true
    }
    pub fn execute(&mut self, initrc: &[String], cmds: &[String]) -> ExecOutcome {
        let script = format!("exec 2>&1 ; {} ; {}", initrc.join(" ; "), cmds.join(" ; "));
        match run_bash_command(&script, None) {
            Ok(output) => {
                let status = output.status.code().unwrap_or(255);
                ExecOutcome {
                    ok: output.status.success(),
                    stdout: Some(output.stdout),
                    status: Some(status.to_string()),
                }
            }
            Err(e) => {
                warn!("Failed to spawn bash: {e}");
                ExecOutcome::session_lost()
            }
        }
    }
}

/// One persistent interactive shell per worker, reached through a directly
/// spawned `ssh -tt` child. The remote side announces itself with the
/// SSH_ON marker; a dead child takes the place of the historical SSH_OFF
/// sentinel. Connection loss is not retried here; the owning worker builds
/// a fresh executor before the next task.
pub struct SshExecutor {
    node_name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    is_alive: bool,
}
impl SshExecutor {
    pub fn connect(node: &Node) -> Result<Self> {
        retry::retry(Fixed::from_millis(1000).take(MAX_CONNECTION_TRIES), || {
            Self::try_connect(node).inspect_err(|e| {
                warn!(
                    "SSH connection against {} has failed, trying again: {e:?}",
                    node.name
                );
            })
        })
        .map_err(|_| {
            anyhow!(
                "Failed to establish an ssh session with {} ({}) after {} attempts",
                node.name,
                node.credential(),
                MAX_CONNECTION_TRIES
            )
        })
    }

    fn try_connect(node: &Node) -> Result<Self> {
        let mut cmd = Command::new("ssh");
        cmd.args(COMMON_SSH_OPTIONS);
        if let Some(key) = &node.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-p").arg(node.port.to_string());
        cmd.arg("-tt");
        cmd.arg(node.credential());
        // The remote command is not typed input, so the marker needs no
        // escaping here.
        cmd.arg(format!("echo {KEY_SSH_ON} ; bash"));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        debug!("Starting ssh session: {cmd:?}");
        let mut child = cmd.spawn().context("Failed to spawn ssh")?;
        let stdin = child.stdin.take().context("ssh stdin was not piped")?;
        let stdout = child.stdout.take().context("ssh stdout was not piped")?;
        let mut executor = SshExecutor {
            node_name: node.name.clone(),
            child,
            stdin,
            stdout,
            is_alive: false,
        };
        let mut lines: Vec<Vec<u8>> = Vec::new();
        loop {
            let (start, end) = executor.read_lines(&mut lines)?;
            for line in &lines[start..end] {
                if contains(line, KEY_SSH_ON.as_bytes()) {
                    debug!("SSH connection established with {}", executor.node_name);
                    executor.is_alive = true;
                    return Ok(executor);
                }
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    /// Reads one chunk from the session and splits it into lines, keeping
    /// the invariant that the last element is the still-unterminated
    /// partial line. Returns the index range worth scanning for markers.
    fn read_lines(&mut self, lines: &mut Vec<Vec<u8>>) -> Result<(usize, usize)> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let n = self
            .stdout
            .read(&mut buf)
            .context("Failed to read from the ssh session")?;
        if n == 0 {
            bail!("The ssh stream was closed");
        }
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut last = 0;
        for i in 0..n {
            if buf[i] == b'\n' {
                chunks.push(buf[last..=i].to_vec());
                last = i + 1;
            }
        }
        chunks.push(buf[last..n].to_vec());
        let start_search = lines.len().saturating_sub(1);
        let mut chunks = chunks.into_iter();
        match lines.last_mut() {
            Some(partial) => {
                partial.extend_from_slice(&chunks.next().unwrap_or_default());
                lines.extend(chunks);
            }
            None => lines.extend(chunks),
        }
        Ok((start_search, lines.len()))
    }

    fn mark_dead(&mut self) {
        self.is_alive = false;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    pub fn execute(&mut self, initrc: &[String], cmds: &[String]) -> ExecOutcome {
        // The task runs inside a subshell so `set -e` aborts the group on
        // the first failure without taking the persistent shell down, and
        // the status echo still reports the group's exit code.
        let cmd_str = format!(
            "{} ; ( {} ; {} ) ; {}\n",
            echo_marker(KEY_CMD_ON),
            initrc.join(" ; "),
            cmds.join(" ; "),
            echo_status_marker(KEY_CMD_OFF),
        );
        if let Err(e) = self
            .stdin
            .write_all(cmd_str.as_bytes())
            .and_then(|_| self.stdin.flush())
        {
            warn!("The ssh session against {} died: {e}", self.node_name);
            self.mark_dead();
            return ExecOutcome::session_lost();
        }
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut output_start = 0;
        let mut output_end: Option<usize> = None;
        loop {
            let (start, end) = match self.read_lines(&mut lines) {
                Ok(range) => range,
                Err(e) => {
                    warn!("The ssh session against {} died: {e:?}", self.node_name);
                    self.mark_dead();
                    return ExecOutcome::session_lost();
                }
            };
            for i in start..end {
                if contains(&lines[i], KEY_CMD_ON.as_bytes()) {
                    output_start = i + 1;
                } else if output_end.is_none() && contains(&lines[i], KEY_CMD_OFF.as_bytes()) {
                    output_end = Some(i);
                }
            }
            if let Some(end) = output_end {
                let status = first_token(&lines[end]).unwrap_or_else(|| "255".to_string());
                let stdout = Self::collect_output(&lines[output_start.min(end)..end]);
                return ExecOutcome {
                    ok: status == "0",
                    stdout: Some(stdout),
                    status: Some(status),
                };
            }
        }
    }

    /// Joins the captured lines, undoing two artifacts of the remote pty:
    /// CRLF line endings and the extra blank line contributed by the
    /// newline inside the closing status echo.
    fn collect_output(lines: &[Vec<u8>]) -> Vec<u8> {
        let mut normalized: Vec<&[u8]> = lines
            .iter()
            .map(|line| {
                if line.ends_with(b"\r\n") {
                    &line[..line.len() - 2]
                } else if line.ends_with(b"\n") {
                    &line[..line.len() - 1]
                } else {
                    &line[..]
                }
            })
            .collect();
        if normalized.last().map(|line| line.is_empty()).unwrap_or(false) {
            normalized.pop();
        }
        let mut out = Vec::new();
        for line in normalized {
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        out
    }
}
impl Drop for SshExecutor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
