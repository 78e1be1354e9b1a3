//! Environment-derived knobs for the pipeline (spec §6).
//!
//! Mirrors the teacher's builder-with-defaults pattern
//! (`NetflowParserBuilder`/`variable_versions::Config`): a `Default` impl
//! gives sane values, `from_env` overlays whatever the process environment
//! sets without ever panicking on a malformed value.

use std::env;

/// Default queue capacity between pipeline stages.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100_000;
/// Default payload-length threshold (bytes) below which a segment is "tiny".
pub const DEFAULT_TINY_TCP_PAYLOAD_BYTES: usize = 32;
/// Default per-lane stream table cap.
pub const DEFAULT_MAX_TCP_STREAMS_COUNT: usize = 65_536;

/// Runtime configuration for the pipeline, sourced from environment
/// variables with library defaults as fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capacity of every bounded inter-stage queue.
    pub channel_buffer_size: usize,
    /// Payload length (bytes) at or below which a data segment counts as "tiny".
    pub tiny_tcp_payload_bytes: usize,
    /// Maximum number of live streams tracked per reassembly lane.
    pub max_tcp_streams_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            tiny_tcp_payload_bytes: DEFAULT_TINY_TCP_PAYLOAD_BYTES,
            max_tcp_streams_count: DEFAULT_MAX_TCP_STREAMS_COUNT,
        }
    }
}

impl PipelineConfig {
    /// Reads `CHANNEL_BUFFER_SIZE`, `TINY_TCP_PAYLOAD_BYTES` and
    /// `MAX_TCP_STREAMS_COUNT` from the environment, falling back to
    /// [`PipelineConfig::default`] for any variable that is unset or fails
    /// to parse as an integer.
    ///
    /// Note the source's `TINY_TCP_PAYLOAD_BYTES` reader assigns the parsed
    /// value only when parsing *fails* -- almost certainly inverted. This
    /// assigns on successful parse, as intended.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            channel_buffer_size: read_usize_env("CHANNEL_BUFFER_SIZE", defaults.channel_buffer_size),
            tiny_tcp_payload_bytes: read_usize_env(
                "TINY_TCP_PAYLOAD_BYTES",
                defaults.tiny_tcp_payload_bytes,
            ),
            max_tcp_streams_count: read_usize_env(
                "MAX_TCP_STREAMS_COUNT",
                defaults.max_tcp_streams_count,
            ),
        }
    }
}

fn read_usize_env(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("{name}={raw:?} is not a valid integer, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.channel_buffer_size, 100_000);
        assert_eq!(cfg.tiny_tcp_payload_bytes, 32);
        assert_eq!(cfg.max_tcp_streams_count, 65_536);
    }

    #[test]
    fn from_env_falls_back_on_garbage() {
        // SAFETY: test-only, single-threaded env mutation guarded by serial execution
        // within this process via cargo test's default thread-per-test isolation risk
        // is accepted here because the var name is unique to this test.
        unsafe { env::set_var("TINY_TCP_PAYLOAD_BYTES", "not-a-number") };
        let cfg = PipelineConfig::from_env();
        assert_eq!(cfg.tiny_tcp_payload_bytes, DEFAULT_TINY_TCP_PAYLOAD_BYTES);
        unsafe { env::remove_var("TINY_TCP_PAYLOAD_BYTES") };
    }
}
