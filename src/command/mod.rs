//! Child process specifications built from deliveries.
//!
//! A [`Builder`] turns one delivery (properties, delivery info, body) into a
//! fully materialized [`CommandSpec`]. Two encodings exist:
//!
//! - [`ArgumentBuilder`]: the payload (optionally wrapped in a metadata
//!   envelope, optionally zlib-compressed, always base64-encoded) becomes the
//!   child's last argument.
//! - [`PipeBuilder`]: the raw body arrives on the child's stdin and the
//!   metadata envelope as JSON on fd 3.

mod argument;
mod pipe;

pub use argument::ArgumentBuilder;
pub use pipe::PipeBuilder;

use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::delivery::{DeliveryInfo, Properties};

/// File descriptor on which the pipe-form child receives the metadata.
pub const METADATA_FD: i32 = 3;

/// Errors raised while materializing a command specification.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compress(#[source] io::Error),

    #[error("failed to create pipe: {0}")]
    Pipe(#[source] io::Error),
}

/// Builds a [`CommandSpec`] from one delivery.
pub trait Builder: Send + Sync {
    fn build(
        &self,
        properties: &Properties,
        info: &DeliveryInfo,
        body: &[u8],
    ) -> Result<CommandSpec, BuildError>;
}

/// Select the builder for the configured encoding. The pipe form overrides
/// compression and the metadata envelope.
pub fn from_config(
    executable: &str,
    capture: bool,
    compressed: bool,
    with_metadata: bool,
    pipe: bool,
) -> Box<dyn Builder> {
    if pipe {
        return Box::new(PipeBuilder::new(executable, capture));
    }

    Box::new(
        ArgumentBuilder::new(executable, capture)
            .compressed(compressed)
            .with_metadata(with_metadata),
    )
}

/// The JSON metadata envelope. The pipe form omits the body; the child
/// receives it on stdin instead.
#[derive(Serialize)]
pub(crate) struct Envelope<'a> {
    pub properties: &'a Properties,
    pub delivery_info: &'a DeliveryInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Parent side of the metadata pipe. The read end is handed to the child as
/// fd 3 and closed in the parent right after spawn; the write end is closed
/// once the payload has been written, so the child observes EOF.
pub(crate) struct MetadataPipe {
    pub payload: Vec<u8>,
    pub reader: OwnedFd,
    pub writer: OwnedFd,
}

/// A fully resolved child process descriptor.
///
/// Running it consumes the spec: the child is spawned, payload and metadata
/// are fed in, output is either streamed to the log or buffered, and the
/// exit code is returned (1 for terminations without an exit status).
pub struct CommandSpec {
    pub(crate) command: Command,
    pub(crate) stdin: Option<Vec<u8>>,
    pub(crate) metadata: Option<MetadataPipe>,
    pub(crate) capture: bool,
}

impl CommandSpec {
    /// The resolved program name.
    pub fn program(&self) -> String {
        self.command.as_std().get_program().to_string_lossy().into_owned()
    }

    /// The resolved argument list.
    pub fn args(&self) -> Vec<String> {
        self.command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Spawn the child, feed it, and wait for its exit code.
    pub async fn run(mut self) -> io::Result<i32> {
        self.command
            .stdin(match self.stdin {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.command.spawn()?;

        // The read end belongs to the child now.
        let metadata = self.metadata.take().map(|m| {
            drop(m.reader);
            (m.payload, m.writer)
        });

        let out_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, self.capture, false)));
        let err_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, self.capture, true)));

        // Both payload channels are written concurrently; the child decides
        // in which order it reads them. Write failures mean the child went
        // away without consuming its input, which the exit status reports
        // better than a broken pipe would.
        let stdin_task = self.stdin.take().and_then(|body| {
            child.stdin.take().map(|mut sink| {
                tokio::spawn(async move {
                    if let Err(e) = sink.write_all(&body).await {
                        debug!(error = %e, "Child stopped reading its stdin");
                    }
                })
            })
        });

        let metadata_task = metadata.map(|(payload, writer)| {
            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut pipe = std::fs::File::from(writer);
                if let Err(e) = pipe.write_all(&payload) {
                    debug!(error = %e, "Child stopped reading its metadata");
                }
            })
        });

        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        if let Some(task) = metadata_task {
            let _ = task.await;
        }

        let status = child.wait().await?;
        let code = status.code().unwrap_or(1);

        let mut combined = match out_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(task) = err_task {
            combined.extend(task.await.unwrap_or_default());
        }

        if code != 0 && !self.capture && !combined.is_empty() {
            error!("Failed: {}", String::from_utf8_lossy(&combined));
        }

        Ok(code)
    }
}

/// Read one output stream of the child. With capture enabled the stream is
/// logged line by line; otherwise it is collected for the failure log.
async fn drain<R: AsyncRead + Unpin>(stream: R, capture: bool, is_stderr: bool) -> Vec<u8> {
    if !capture {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stream);
        let _ = reader.read_to_end(&mut buf).await;
        return buf;
    }

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            error!("{line}");
        } else {
            info!("{line}");
        }
    }

    Vec::new()
}

/// Split the configured executable string into the program and its static
/// argument tail.
pub(crate) fn split_executable(executable: &str) -> (String, Vec<String>) {
    let mut parts = executable.split(' ');
    let program = parts.next().unwrap_or_default().to_owned();

    (program, parts.map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn executable_splits_on_spaces() {
        assert_eq!(split_executable("worker"), ("worker".to_owned(), vec![]));
        assert_eq!(
            split_executable("php bin/console message:consume"),
            (
                "php".to_owned(),
                vec!["bin/console".to_owned(), "message:consume".to_owned()]
            )
        );
    }

    #[tokio::test]
    async fn run_returns_the_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit.sh", "#!/bin/sh\nexit 42\n");

        let spec = ArgumentBuilder::new(script.to_str().unwrap(), false)
            .build(&Properties::default(), &DeliveryInfo::default(), b"body")
            .unwrap();

        assert_eq!(spec.run().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_reports_spawn_failures() {
        let spec = ArgumentBuilder::new("/nonexistent/worker", false)
            .build(&Properties::default(), &DeliveryInfo::default(), b"body")
            .unwrap();

        assert!(spec.run().await.is_err());
    }

    #[tokio::test]
    async fn argument_child_receives_the_encoded_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("argv");
        let script = write_script(
            dir.path(),
            "echo.sh",
            &format!("#!/bin/sh\nprintf '%s' \"$1\" > {}\n", out.display()),
        );

        let spec = ArgumentBuilder::new(script.to_str().unwrap(), false)
            .build(&Properties::default(), &DeliveryInfo::default(), b"default")
            .unwrap();
        assert_eq!(spec.run().await.unwrap(), 0);

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "ZGVmYXVsdA==");
    }

    #[tokio::test]
    async fn pipe_child_reads_body_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let stdin_out = dir.path().join("stdin");
        let meta_out = dir.path().join("fd3");
        let script = write_script(
            dir.path(),
            "pipe.sh",
            &format!(
                "#!/bin/sh\ncat > {} \ncat <&3 > {}\n",
                stdin_out.display(),
                meta_out.display()
            ),
        );

        let spec = PipeBuilder::new(script.to_str().unwrap(), false)
            .build(&Properties::default(), &DeliveryInfo::default(), b"pipe")
            .unwrap();
        assert_eq!(spec.run().await.unwrap(), 0);

        assert_eq!(std::fs::read_to_string(&stdin_out).unwrap(), "pipe");
        assert_eq!(
            std::fs::read_to_string(&meta_out).unwrap(),
            "{\"properties\":{\"application_headers\":null,\"content_type\":\"\",\
             \"content_encoding\":\"\",\"delivery_mode\":0,\"priority\":0,\
             \"correlation_id\":\"\",\"reply_to\":\"\",\"expiration\":\"\",\
             \"message_id\":\"\",\"timestamp\":\"0001-01-01T00:00:00Z\",\"type\":\"\",\
             \"user_id\":\"\",\"app_id\":\"\"},\"delivery_info\":{\"message_count\":0,\
             \"consumer_tag\":\"\",\"delivery_tag\":0,\"redelivered\":false,\
             \"exchange\":\"\",\"routing_key\":\"\"}}"
        );
    }
}
