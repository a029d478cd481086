use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::AgentError;
use crate::types::{AgentCommand, CancelToken};

/// Longest chunk a reader forwards; longer lines arrive split.
const MAX_LINE_BYTES: u64 = 64 * 1024;
/// Collected output keeps at least this many trailing bytes once trimmed.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    /// Interleaved stdout/stderr lines in arrival order. Invalid UTF-8 is
    /// replaced; very long output keeps only its tail.
    pub output: String,
    pub elapsed: Duration,
}

/// Runs a worker process to completion, its deadline, or cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRunner {
    pub poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ProcessRunner {
    pub fn run(
        &self,
        command: &AgentCommand,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput, AgentError> {
        if timeout.is_zero() {
            return Err(AgentError::InvalidRequest {
                message: "timeout must be greater than zero".to_string(),
            });
        }

        let rendered = render_command(command);
        let started = Instant::now();
        let deadline = started + timeout;

        let mut child_command = Command::new(&command.executable);
        child_command
            .args(&command.args)
            .current_dir(cwd)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &command.env {
            if !key.trim().is_empty() {
                child_command.env(key, value);
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            child_command.process_group(0);
        }

        debug!(command = %rendered, "spawning worker");
        let mut child = child_command.spawn().map_err(|source| AgentError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                let _ = stdin.write_all(input.as_bytes());
            });
        }

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = String::new();
        let status = loop {
            drain(&rx, &mut output);

            if cancel.is_cancelled() {
                warn!(command = %rendered, "worker cancelled, killing");
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(AgentError::Cancelled);
            }

            if Instant::now() >= deadline {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(command = %rendered, elapsed_ms, "worker deadline exceeded, killing");
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(AgentError::Timeout { elapsed_ms });
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    return Err(AgentError::Runtime {
                        command: rendered,
                        source,
                    });
                }
            }

            thread::sleep(self.poll_interval);
        };

        for reader in readers {
            let _ = reader.join();
        }
        drain(&rx, &mut output);

        debug!(exit_code = ?status.code(), "worker exited");
        Ok(ProcessOutput {
            exit_code: status.code(),
            output,
            elapsed: started.elapsed(),
        })
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match buf.by_ref().take(MAX_LINE_BYTES).read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "worker output stream closed");
                    break;
                }
            }
        }
    })
}

fn drain(rx: &mpsc::Receiver<String>, output: &mut String) {
    while let Ok(line) = rx.try_recv() {
        output.push_str(&line);
        if output.len() > 2 * MAX_OUTPUT_BYTES {
            keep_tail(output, MAX_OUTPUT_BYTES);
        }
    }
}

fn keep_tail(output: &mut String, max_bytes: usize) {
    let mut start = output.len().saturating_sub(max_bytes);
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output.drain(..start);
}

fn kill_tree(child: &mut Child) {
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

pub(crate) fn render_command(command: &AgentCommand) -> String {
    let mut rendered = command.executable.clone();
    for arg in &command.args {
        rendered.push(' ');
        if arg.chars().count() > 60 {
            rendered.extend(arg.chars().take(60));
            rendered.push_str("...");
        } else {
            rendered.push_str(arg);
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("RELAY_TEST".to_string(), "on".to_string())],
            stdin: None,
        }
    }

    #[test]
    fn collects_output_and_exit_code() {
        let out = ProcessRunner::default()
            .run(
                &sh("echo out; echo err >&2; echo $RELAY_TEST; exit 4"),
                &std::env::temp_dir(),
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .expect("run");
        assert_eq!(out.exit_code, Some(4));
        assert!(out.output.contains("out\n"));
        assert!(out.output.contains("err\n"));
        assert!(out.output.contains("on\n"));
    }

    #[test]
    fn invalid_utf8_output_is_replaced_not_lost() {
        let out = ProcessRunner::default()
            .run(
                &sh("printf 'a\\377b\\n'; echo after; exit 3"),
                &std::env::temp_dir(),
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("a\u{FFFD}b\n"));
        assert!(out.output.contains("after\n"));
    }

    #[test]
    fn long_output_keeps_its_tail() {
        let out = ProcessRunner::default()
            .run(
                &sh("head -c 3000000 /dev/zero | tr '\\0' x; echo; echo tail-marker"),
                &std::env::temp_dir(),
                Duration::from_secs(30),
                &CancelToken::new(),
            )
            .expect("run");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.len() <= 2 * MAX_OUTPUT_BYTES);
        assert!(out.output.ends_with("tail-marker\n"));
    }

    #[test]
    fn keep_tail_respects_char_boundaries() {
        let mut text = "ééé".to_string();
        keep_tail(&mut text, 3);
        assert_eq!(text, "é");
    }

    #[test]
    fn stdin_is_delivered_and_closed() {
        let mut command = sh("cat");
        command.stdin = Some("prompt body\n".to_string());
        let out = ProcessRunner::default()
            .run(
                &command,
                &std::env::temp_dir(),
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .expect("run");
        assert_eq!(out.output, "prompt body\n");
    }

    #[test]
    fn deadline_kills_the_worker() {
        let started = Instant::now();
        let err = ProcessRunner::default()
            .run(
                &sh("sleep 30"),
                &std::env::temp_dir(),
                Duration::from_millis(200),
                &CancelToken::new(),
            )
            .expect_err("should time out");
        assert!(matches!(err, AgentError::Timeout { elapsed_ms } if elapsed_ms >= 200));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_token_stops_the_worker() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        let err = ProcessRunner::default()
            .run(
                &sh("sleep 30"),
                &std::env::temp_dir(),
                Duration::from_secs(20),
                &cancel,
            )
            .expect_err("should be cancelled");
        assert!(matches!(err, AgentError::Cancelled));
        handle.join().expect("join trigger");
    }

    #[test]
    fn zero_timeout_is_rejected_before_spawning() {
        let err = ProcessRunner::default()
            .run(
                &sh("true"),
                &std::env::temp_dir(),
                Duration::ZERO,
                &CancelToken::new(),
            )
            .expect_err("zero timeout");
        assert!(matches!(err, AgentError::InvalidRequest { .. }));
    }

    #[test]
    fn render_command_shortens_long_prompts() {
        let command = AgentCommand {
            executable: "claude".to_string(),
            args: vec!["-p".to_string(), "é".repeat(100)],
            env: vec![],
            stdin: None,
        };
        let rendered = render_command(&command);
        assert!(rendered.starts_with("claude -p "));
        assert!(rendered.ends_with("..."));
    }
}
