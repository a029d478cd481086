//! Shell command execution with a deadline and a bounded output tail.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::VerifyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommandOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// stdout followed by stderr, tail-truncated to the output limit.
    pub output: String,
    pub truncated_bytes: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

pub fn run_shell_command(
    cwd: &Path,
    shell_bin: &str,
    command_line: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ShellCommandOutput, VerifyError> {
    let rendered = format!("{shell_bin} -c {command_line}");
    let started = Instant::now();

    let mut command = Command::new(shell_bin);
    command
        .arg("-c")
        .arg(command_line)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!(command = %command_line, cwd = %cwd.display(), "spawning verify command");
    let mut child = command.spawn().map_err(|source| VerifyError::Io {
        command: rendered.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| VerifyError::Pipe {
        command: rendered.clone(),
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or_else(|| VerifyError::Pipe {
        command: rendered.clone(),
        stream: "stderr",
    })?;
    let stdout_handle = thread::spawn(move || read_tail(stdout, max_output_bytes));
    let stderr_handle = thread::spawn(move || read_tail(stderr, max_output_bytes));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(timeout)
        .map_err(|source| VerifyError::Wait {
            command: rendered.clone(),
            source,
        })? {
        Some(status) => status,
        None => {
            warn!(
                command = %command_line,
                timeout_ms = timeout.as_millis() as u64,
                "verify command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().map_err(|source| VerifyError::Wait {
                command: rendered.clone(),
                source,
            })?
        }
    };

    let (out_bytes, out_dropped) = join_reader(stdout_handle, &rendered, "stdout")?;
    let (err_bytes, err_dropped) = join_reader(stderr_handle, &rendered, "stderr")?;
    let (output, truncated_bytes) =
        combine_output(&out_bytes, &err_bytes, out_dropped + err_dropped, max_output_bytes);

    debug!(exit_code = ?status.code(), timed_out, "verify command finished");
    Ok(ShellCommandOutput {
        exit_code: status.code(),
        success: status.success() && !timed_out,
        output,
        truncated_bytes,
        timed_out,
        duration: started.elapsed(),
    })
}

/// Kill the child and everything it spawned.
pub fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let _ = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<(Vec<u8>, usize)>>,
    command: &str,
    stream: &'static str,
) -> Result<(Vec<u8>, usize), VerifyError> {
    match handle.join() {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(source)) => Err(VerifyError::Read {
            command: command.to_string(),
            stream,
            source,
        }),
        Err(_) => Err(VerifyError::Pipe {
            command: command.to_string(),
            stream,
        }),
    }
}

/// Drain `reader`, keeping only the last `limit` bytes. Returns the kept
/// bytes and how many were dropped.
pub fn read_tail<R: Read>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit.saturating_mul(2).max(8192) {
            let excess = kept.len() - limit;
            kept.drain(..excess);
            dropped += excess;
        }
    }

    if kept.len() > limit {
        let excess = kept.len() - limit;
        kept.drain(..excess);
        dropped += excess;
    }
    Ok((kept, dropped))
}

/// Concatenate both streams and keep the tail, marking any truncation.
pub fn combine_output(
    stdout: &[u8],
    stderr: &[u8],
    already_dropped: usize,
    limit: usize,
) -> (String, usize) {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));

    let mut dropped = already_dropped;
    if combined.len() > limit {
        let mut cut = combined.len() - limit;
        while !combined.is_char_boundary(cut) {
            cut += 1;
        }
        dropped += cut;
        combined.drain(..cut);
    }

    if dropped > 0 {
        combined.insert_str(0, &format!("[output truncated: {dropped} bytes omitted]\n"));
    }
    (combined, dropped)
}
