use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Output of a command whose exit status the caller interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStatusOutput {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitStatusOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn into_error(self) -> GitError {
        GitError::CommandFailed {
            command: self.command,
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Author/committer identity passed as `-c user.*` on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
    pub identity: Option<GitIdentity>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            identity: None,
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some(GitIdentity {
            name: name.into(),
            email: email.into(),
        });
        self
    }

    /// Run git and fail on a non-zero exit.
    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run_status(cwd, args)?;
        if !output.success() {
            return Err(output.into_error());
        }
        Ok(GitOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run git and return the exit status alongside the output.
    pub fn run_status<I, S>(&self, cwd: &Path, args: I) -> Result<GitStatusOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut owned_args: Vec<OsString> = Vec::new();
        if let Some(identity) = &self.identity {
            owned_args.push(OsString::from("-c"));
            owned_args.push(OsString::from(format!("user.name={}", identity.name)));
            owned_args.push(OsString::from("-c"));
            owned_args.push(OsString::from(format!("user.email={}", identity.email)));
        }
        owned_args.extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));

        let mut command = Command::new(&self.binary);
        command.current_dir(cwd).args(&owned_args);

        let rendered = render_command(&self.binary, &owned_args);
        let output = command.output().map_err(|source| GitError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| GitError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            })?;
        let stderr =
            String::from_utf8(output.stderr).map_err(|source| GitError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            })?;

        Ok(GitStatusOutput {
            command: rendered,
            status: output.status.code(),
            stdout,
            stderr,
        })
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
