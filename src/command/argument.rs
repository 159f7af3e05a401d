//! Argument-form command builder.

use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::process::Command;
use tracing::debug;

use crate::delivery::{DeliveryInfo, Properties};

use super::{split_executable, BuildError, Builder, CommandSpec, Envelope};

/// Builds commands that receive the payload as their final argument.
///
/// The payload is the raw body, or the JSON metadata envelope including the
/// body when configured. It is optionally zlib-compressed at the best
/// compression level, and always base64-encoded with the standard padded
/// alphabet. The child gets no stdin and no extra file descriptor and
/// inherits the environment.
pub struct ArgumentBuilder {
    program: String,
    args: Vec<String>,
    capture: bool,
    compressed: bool,
    with_metadata: bool,
}

impl ArgumentBuilder {
    pub fn new(executable: &str, capture: bool) -> Self {
        let (program, args) = split_executable(executable);

        ArgumentBuilder {
            program,
            args,
            capture,
            compressed: false,
            with_metadata: false,
        }
    }

    /// Compress the payload with zlib before encoding it.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Wrap the payload in the JSON metadata envelope.
    pub fn with_metadata(mut self, with_metadata: bool) -> Self {
        self.with_metadata = with_metadata;
        self
    }
}

impl Builder for ArgumentBuilder {
    fn build(
        &self,
        properties: &Properties,
        info: &DeliveryInfo,
        body: &[u8],
    ) -> Result<CommandSpec, BuildError> {
        let payload = if self.with_metadata {
            serde_json::to_vec(&Envelope {
                properties,
                delivery_info: info,
                body: Some(String::from_utf8_lossy(body).into_owned()),
            })?
        } else {
            body.to_vec()
        };

        let stream = if self.compressed {
            debug!("Compressed message");
            compress(&payload).map_err(BuildError::Compress)?
        } else {
            payload
        };

        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(STANDARD.encode(&stream));
        command.kill_on_drop(false);

        Ok(CommandSpec {
            command,
            stdin: None,
            metadata: None,
            capture: self.capture,
        })
    }
}

fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(payload)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn build(builder: &ArgumentBuilder, body: &[u8]) -> CommandSpec {
        builder
            .build(&Properties::default(), &DeliveryInfo::default(), body)
            .unwrap()
    }

    #[test]
    fn plain_body_is_base64_encoded() {
        let builder = ArgumentBuilder::new("default", false);
        let spec = build(&builder, b"default");

        assert_eq!(spec.program(), "default");
        assert_eq!(spec.args(), vec!["ZGVmYXVsdA=="]);
        assert!(spec.stdin.is_none());
        assert!(spec.metadata.is_none());
    }

    #[test]
    fn static_argument_tail_is_preserved() {
        let builder = ArgumentBuilder::new("complex command", false);
        let spec = build(&builder, b"complex command");

        assert_eq!(spec.program(), "complex");
        assert_eq!(spec.args(), vec!["command", "Y29tcGxleCBjb21tYW5k"]);
    }

    #[test]
    fn metadata_envelope_matches_the_wire_format() {
        let builder = ArgumentBuilder::new("metadata", false).with_metadata(true);
        let spec = build(&builder, b"metadata");

        assert_eq!(
            spec.args(),
            vec![
                "eyJwcm9wZXJ0aWVzIjp7ImFwcGxpY2F0aW9uX2hlYWRlcnMiOm51bGwsImNvbnRlbnRfdHlwZSI6\
                 IiIsImNvbnRlbnRfZW5jb2RpbmciOiIiLCJkZWxpdmVyeV9tb2RlIjowLCJwcmlvcml0eSI6MCwi\
                 Y29ycmVsYXRpb25faWQiOiIiLCJyZXBseV90byI6IiIsImV4cGlyYXRpb24iOiIiLCJtZXNzYWdl\
                 X2lkIjoiIiwidGltZXN0YW1wIjoiMDAwMS0wMS0wMVQwMDowMDowMFoiLCJ0eXBlIjoiIiwidXNl\
                 cl9pZCI6IiIsImFwcF9pZCI6IiJ9LCJkZWxpdmVyeV9pbmZvIjp7Im1lc3NhZ2VfY291bnQiOjAs\
                 ImNvbnN1bWVyX3RhZyI6IiIsImRlbGl2ZXJ5X3RhZyI6MCwicmVkZWxpdmVyZWQiOmZhbHNlLCJl\
                 eGNoYW5nZSI6IiIsInJvdXRpbmdfa2V5IjoiIn0sImJvZHkiOiJtZXRhZGF0YSJ9"
            ]
        );
    }

    #[test]
    fn compressed_payload_is_reversible() {
        let builder = ArgumentBuilder::new("compressed", false).compressed(true);
        let spec = build(&builder, b"compressed");

        let raw = STANDARD.decode(spec.args().pop().unwrap()).unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(raw.as_slice());
        let mut restored = String::new();
        decoder.read_to_string(&mut restored).unwrap();

        assert_eq!(restored, "compressed");
    }

    #[test]
    fn decodes_streams_from_other_zlib_writers() {
        // Wire sample produced by a different best-compression zlib encoder.
        let raw = STANDARD.decode("eNpKzs8tKEotLk5NAQQAAP//Fz8ENg==").unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(raw.as_slice());
        let mut restored = String::new();
        decoder.read_to_string(&mut restored).unwrap();

        assert_eq!(restored, "compressed");
    }

    #[test]
    fn compressed_metadata_is_reversible() {
        let builder = ArgumentBuilder::new("worker", false)
            .compressed(true)
            .with_metadata(true);
        let spec = build(&builder, b"compressedMetadata");

        let raw = STANDARD.decode(spec.args().pop().unwrap()).unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(raw.as_slice());
        let mut restored = String::new();
        decoder.read_to_string(&mut restored).unwrap();

        let envelope: serde_json::Value = serde_json::from_str(&restored).unwrap();
        assert_eq!(envelope["body"], "compressedMetadata");
        assert_eq!(envelope["properties"]["timestamp"], "0001-01-01T00:00:00Z");
    }
}
