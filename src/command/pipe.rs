//! Pipe-form command builder.

use std::io;
use std::os::fd::AsRawFd;

use tokio::process::Command;

use crate::delivery::{DeliveryInfo, Properties};

use super::{split_executable, BuildError, Builder, CommandSpec, Envelope, MetadataPipe, METADATA_FD};

/// Builds commands that receive the raw body on stdin and the metadata
/// envelope as JSON on fd 3.
///
/// The static argument list is passed unchanged; no payload argument is
/// appended. The pipe's read end is moved onto fd 3 between fork and exec;
/// the write end stays with the parent until the metadata has been written
/// after spawn.
pub struct PipeBuilder {
    program: String,
    args: Vec<String>,
    capture: bool,
}

impl PipeBuilder {
    pub fn new(executable: &str, capture: bool) -> Self {
        let (program, args) = split_executable(executable);

        PipeBuilder {
            program,
            args,
            capture,
        }
    }
}

impl Builder for PipeBuilder {
    fn build(
        &self,
        properties: &Properties,
        info: &DeliveryInfo,
        body: &[u8],
    ) -> Result<CommandSpec, BuildError> {
        let payload = serde_json::to_vec(&Envelope {
            properties,
            delivery_info: info,
            body: None,
        })?;

        let (reader, writer) =
            nix::unistd::pipe().map_err(|e| BuildError::Pipe(io::Error::from(e)))?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.kill_on_drop(false);

        let raw = reader.as_raw_fd();
        let writer_fd = writer.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // The child keeps only the read end, on the fixed metadata
                // fd. Its inherited copy of the write end must go away, or
                // reading fd 3 to EOF never terminates.
                nix::unistd::close(writer_fd).map_err(io::Error::from)?;

                if raw != METADATA_FD {
                    nix::unistd::dup2(raw, METADATA_FD).map_err(io::Error::from)?;
                    nix::unistd::close(raw).map_err(io::Error::from)?;
                }

                Ok(())
            });
        }

        Ok(CommandSpec {
            command,
            stdin: Some(body.to_vec()),
            metadata: Some(MetadataPipe {
                payload,
                reader,
                writer,
            }),
            capture: self.capture,
        })
    }
}
