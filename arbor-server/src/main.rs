//! Arbor sync server.
//!
//! Every setting is a CLI flag with an environment fallback, so the same
//! binary runs from a shell or a container:
//!
//! ```text
//! HOST=0.0.0.0 PORT=1234 YPERSISTENCE=./arbor_data arbor-server
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arbor_collab::{
    ConnectionConfig, DecodeErrorPolicy, RegistryConfig, ServerConfig, SyncServer, WebhookConfig,
    WebhookError,
};
use clap::Parser;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "arbor-server")]
#[command(about = "Real-time sync server for Arbor trees", long_about = None)]
struct Args {
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 1234)]
    port: u16,

    /// Endpoint receiving debounced change callbacks
    #[arg(long, env = "CALLBACK_URL")]
    callback_url: Option<String>,

    /// Callback request timeout (ms)
    #[arg(long, env = "CALLBACK_TIMEOUT", default_value_t = 5000)]
    callback_timeout: u64,

    /// Quiet period before a callback fires (ms)
    #[arg(long, env = "CALLBACK_DEBOUNCE_WAIT", default_value_t = 2000)]
    callback_debounce_wait: u64,

    /// Upper bound on callback delay under constant edits (ms)
    #[arg(long, env = "CALLBACK_DEBOUNCE_MAXWAIT", default_value_t = 10000)]
    callback_debounce_maxwait: u64,

    /// Shared objects to include in callbacks, as JSON `{"name": "Map"}`
    #[arg(long, env = "CALLBACK_OBJECTS", default_value = "{}")]
    callback_objects: String,

    /// RocksDB directory. Documents stay in memory when unset.
    #[arg(long, env = "YPERSISTENCE")]
    persistence: Option<PathBuf>,

    /// Tombstone garbage collection (`false` or `0` disables)
    #[arg(long, env = "GC", default_value = "true", value_parser = parse_gc)]
    gc: bool,

    /// Heartbeat period (ms)
    #[arg(long, env = "PING_INTERVAL", default_value_t = 30000)]
    ping_interval: u64,

    /// Disconnect after this many bad frames. Unset keeps the connection.
    #[arg(long, env = "MAX_DECODE_ERRORS")]
    max_decode_errors: Option<u32>,

    /// Evict idle documents after this delay (ms). Needs persistence.
    #[arg(long, env = "IDLE_EVICT")]
    idle_evict: Option<u64>,

    /// Frames buffered per connection before it counts as lagging
    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = 1024)]
    broadcast_capacity: usize,
}

#[derive(Debug, Error)]
enum ConfigError {
    #[error("CALLBACK_OBJECTS: {0}")]
    CallbackObjects(#[source] WebhookError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

fn parse_gc(value: &str) -> Result<bool, String> {
    Ok(!matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0"))
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        if self.ping_interval == 0 {
            return Err(ConfigError::Zero("PING_INTERVAL"));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Zero("BROADCAST_CAPACITY"));
        }
        let decode_policy = match self.max_decode_errors {
            Some(0) => return Err(ConfigError::Zero("MAX_DECODE_ERRORS")),
            Some(max_errors) => DecodeErrorPolicy::Strict { max_errors },
            None => DecodeErrorPolicy::Lenient,
        };

        let webhook = match self.callback_url {
            Some(url) => {
                let mut webhook = WebhookConfig::new(url);
                webhook.timeout = Duration::from_millis(self.callback_timeout);
                webhook.wait = Duration::from_millis(self.callback_debounce_wait);
                webhook.max_wait = Duration::from_millis(self.callback_debounce_maxwait);
                webhook.objects = WebhookConfig::parse_objects(&self.callback_objects)
                    .map_err(ConfigError::CallbackObjects)?;
                Some(webhook)
            }
            None => None,
        };

        Ok(ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            connection: ConnectionConfig {
                ping_interval: Duration::from_millis(self.ping_interval),
                decode_policy,
                ..ConnectionConfig::default()
            },
            registry: RegistryConfig {
                gc: self.gc,
                broadcast_capacity: self.broadcast_capacity,
                idle_evict: self.idle_evict.map(Duration::from_millis),
                ..RegistryConfig::default()
            },
            persistence_path: self.persistence,
            webhook,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = Args::parse().into_config()?;
    match &config.persistence_path {
        Some(path) => log::info!("Persisting documents to {}", path.display()),
        None => log::info!("No persistence configured, documents live in memory"),
    }
    if config.registry.idle_evict.is_some() && config.persistence_path.is_none() {
        log::warn!("IDLE_EVICT ignored without YPERSISTENCE");
    }

    let server = Arc::new(SyncServer::new(config)?);
    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["arbor-server"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_build_config() {
        let config = parse(&[
            "--host",
            "0.0.0.0",
            "--port",
            "4000",
            "--ping-interval",
            "500",
            "--max-decode-errors",
            "3",
            "--idle-evict",
            "60000",
            "--persistence",
            "/tmp/arbor",
            "--broadcast-capacity",
            "64",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.connection.ping_interval, Duration::from_millis(500));
        assert_eq!(
            config.connection.decode_policy,
            DecodeErrorPolicy::Strict { max_errors: 3 }
        );
        assert_eq!(config.registry.idle_evict, Some(Duration::from_secs(60)));
        assert_eq!(config.registry.broadcast_capacity, 64);
        assert_eq!(config.persistence_path, Some(PathBuf::from("/tmp/arbor")));
    }

    #[test]
    fn test_gc_flag() {
        assert_eq!(parse_gc("false"), Ok(false));
        assert_eq!(parse_gc("0"), Ok(false));
        assert_eq!(parse_gc("FALSE"), Ok(false));
        assert_eq!(parse_gc("true"), Ok(true));
        assert_eq!(parse_gc("1"), Ok(true));

        let config = parse(&["--gc", "0"]).into_config().unwrap();
        assert!(!config.registry.gc);
    }

    #[test]
    fn test_callback_settings() {
        let config = parse(&[
            "--callback-url",
            "http://localhost:8080/hook",
            "--callback-objects",
            r#"{"nodes": "Map", "log": "Array"}"#,
            "--callback-debounce-wait",
            "100",
        ])
        .into_config()
        .unwrap();

        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.url, "http://localhost:8080/hook");
        assert_eq!(webhook.wait, Duration::from_millis(100));
        assert_eq!(webhook.objects.len(), 2);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let bad_objects = parse(&["--callback-url", "http://x", "--callback-objects", "[1,"]);
        assert!(matches!(
            bad_objects.into_config(),
            Err(ConfigError::CallbackObjects(_))
        ));

        let zero = parse(&["--max-decode-errors", "0"]);
        assert!(matches!(
            zero.into_config(),
            Err(ConfigError::Zero("MAX_DECODE_ERRORS"))
        ));

        assert!(Args::try_parse_from(["arbor-server", "--port", "not-a-port"]).is_err());
    }
}
