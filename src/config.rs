//! Runtime configuration.
//!
//! Everything has a sensible default; a TOML fragment can override any
//! subset of fields. Persisting configuration is the embedder's business.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network magic prefixing every frame.
    pub magic: [u8; 4],
    /// Protocol version advertised in the handshake.
    pub protocol_version: u32,
    /// Service bits advertised in the handshake.
    pub services: u64,
    pub user_agent: String,
    /// Connection ceiling once headers are caught up.
    pub max_connections: usize,
    /// Connection ceiling while headers are still downloading (kept tight to
    /// avoid conflicting header chains).
    pub headers_phase_connections: usize,
    /// Trusted seed ("ip:port"). When set, the headers phase sticks to this
    /// single connection.
    pub seed_node: Option<String>,
    /// How many connections may download the same block at once. 0 disables
    /// the limit.
    pub max_block_at_once: u32,
    /// Per-connection window of in-flight block requests.
    pub block_window: usize,
    pub dial_timeout_ms: u64,
    /// Read/write deadline for the polling loops. Short on purpose so the
    /// loops re-check the abort and broken flags often.
    pub io_deadline_ms: u64,
    /// Sleep of the send loop when its buffer is empty.
    pub idle_sleep_ms: u64,
    /// Re-request a block whose request has been in flight this long.
    pub block_retry_ms: u64,
    /// Send getaddr after the handshake while the address pool holds fewer
    /// entries than this.
    pub addr_pool_low_water: usize,
    /// Upper bound on a single message payload.
    pub max_payload_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            magic: [0xd4, 0xe5, 0x91, 0x7c],
            protocol_version: 70001,
            services: 1,
            user_agent: "/pyrite:0.1.0/".into(),
            max_connections: 20,
            headers_phase_connections: 5,
            seed_node: None,
            max_block_at_once: 3,
            block_window: 8,
            dial_timeout_ms: 3_000,
            io_deadline_ms: 10,
            idle_sleep_ms: 10,
            block_retry_ms: 10_000,
            addr_pool_low_water: 2_000,
            max_payload_len: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_overrides_defaults() {
        let cfg = Config::from_toml(
            r#"
            max_connections = 3
            seed_node = "10.0.0.1:7072"
            magic = [1, 2, 3, 4]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.seed_node.as_deref(), Some("10.0.0.1:7072"));
        assert_eq!(cfg.magic, [1, 2, 3, 4]);
        // untouched fields keep their defaults
        assert_eq!(cfg.block_window, Config::default().block_window);
    }

    #[test]
    fn garbage_toml_is_an_error() {
        assert!(Config::from_toml("max_connections = \"many\"").is_err());
    }
}
