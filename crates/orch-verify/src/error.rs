use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("verify command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for verify command ({command}): {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading {stream} of verify command ({command}): {source}")]
    Read {
        command: String,
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{stream} of verify command was not captured ({command})")]
    Pipe {
        command: String,
        stream: &'static str,
    },
    #[error("failed to write verify log at {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::VerifyError;
    use std::error::Error;
    use std::path::PathBuf;

    #[test]
    fn io_variant_includes_command_and_preserves_source() {
        let err = VerifyError::Io {
            command: "sh -c cargo test".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("verify command failed to start"));
        assert!(rendered.contains("(sh -c cargo test)"));
        assert!(err.source().is_some());
    }

    #[test]
    fn pipe_and_log_variants_render_context() {
        let pipe = VerifyError::Pipe {
            command: "sh -c true".to_string(),
            stream: "stderr",
        };
        assert!(pipe.to_string().starts_with("stderr of verify command"));
        assert!(pipe.source().is_none());

        let log = VerifyError::Log {
            path: PathBuf::from("/tmp/verify/1-tier0.log"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(log.to_string().contains("1-tier0.log"));
    }
}
