use crate::server::{generation::MAX_CHUNK_SIZE, pool::manager::PoolConfig};
use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `chunkstream-server` binary.
///
/// These settings control the concurrency, admission and shutdown behavior of
/// the chunk generation service. All values are parsed from CLI arguments or
/// environment variables, with defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chunkstream-server",
    version,
    about = "A WebSocket service streaming procedurally generated chunks"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Example: "0.0.0.0:8080" or "127.0.0.1:9000"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Number of chunks that may be generated concurrently across all
    /// connections.
    ///
    /// This is the only throughput control of the service. Generation runs on
    /// the blocking thread pool, so values above the core count mostly add
    /// contention.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS", default_value_t = num_cpus::get())]
    pub max_workers: usize,

    /// Maximum number of accepted-but-unsettled requests per connection.
    ///
    /// Requests beyond this limit are rejected immediately with a
    /// `CHUNK_ERROR`; nothing is queued at the connection level.
    ///
    /// Environment variable: `MAX_INFLIGHT_PER_CLIENT`
    #[arg(long, env = "MAX_INFLIGHT_PER_CLIENT", default_value_t = 64)]
    pub max_inflight_per_client: usize,

    /// Maximum number of requests waiting in the shared queue.
    ///
    /// Once reached, new requests are rejected as "pool saturated" instead of
    /// growing memory without bound.
    ///
    /// Environment variable: `MAX_QUEUE_DEPTH`
    #[arg(long, env = "MAX_QUEUE_DEPTH", default_value_t = 4096)]
    pub max_queue_depth: usize,

    /// Milliseconds after which a running generation is reported as failed.
    ///
    /// The generation itself is not interrupted and keeps its worker slot
    /// until it returns. `0` disables the timeout.
    ///
    /// Environment variable: `GENERATION_TIMEOUT_MS`
    #[arg(long, env = "GENERATION_TIMEOUT_MS", default_value_t = 0)]
    pub generation_timeout_ms: u64,

    /// Seconds to wait for each worker to finish its current chunk during
    /// shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Default chunk edge length used by the built-in generator when the
    /// request config does not carry a `size`.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 16)]
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub max_workers: usize,
    pub max_inflight_per_client: usize,
    pub max_queue_depth: usize,
    pub generation_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub chunk_size: usize,
}

impl ServerConfig {
    /// The slice of the configuration owned by the worker pool.
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            max_queue_depth: self.max_queue_depth,
            generation_timeout: self.generation_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("0.0.0.0:8080"),
            max_workers: num_cpus::get(),
            max_inflight_per_client: 64,
            max_queue_depth: 4096,
            generation_timeout: None,
            shutdown_timeout: Duration::from_secs(3),
            chunk_size: 16,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than 0");
        }

        if args.max_inflight_per_client == 0 {
            bail!("MAX_INFLIGHT_PER_CLIENT must be greater than 0");
        }

        if args.max_queue_depth == 0 {
            bail!("MAX_QUEUE_DEPTH must be greater than 0");
        }

        if args.chunk_size == 0 || args.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "CHUNK_SIZE ({}) must be between 1 and {}",
                args.chunk_size,
                MAX_CHUNK_SIZE
            );
        }

        let generation_timeout =
            (args.generation_timeout_ms > 0).then(|| Duration::from_millis(args.generation_timeout_ms));

        Ok(Self {
            server_addr: args.server_addr,
            max_workers: args.max_workers,
            max_inflight_per_client: args.max_inflight_per_client,
            max_queue_depth: args.max_queue_depth,
            generation_timeout,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            chunk_size: args.chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("chunkstream-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&["--max-workers", "2"]).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_inflight_per_client, 64);
        assert_eq!(config.max_queue_depth, 4096);
        assert_eq!(config.generation_timeout, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.chunk_size, 16);
    }

    #[test]
    fn timeout_is_enabled_when_non_zero() {
        let config = parse(&["--max-workers", "1", "--generation-timeout-ms", "250"]).unwrap();
        assert_eq!(config.generation_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            config.pool_config().generation_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(parse(&["--max-workers", "0"]).is_err());
        assert!(parse(&["--max-workers", "1", "--max-inflight-per-client", "0"]).is_err());
        assert!(parse(&["--max-workers", "1", "--max-queue-depth", "0"]).is_err());
    }

    #[test]
    fn rejects_oversized_chunks() {
        assert!(parse(&["--max-workers", "1", "--chunk-size", "0"]).is_err());
        assert!(parse(&["--max-workers", "1", "--chunk-size", "100000"]).is_err());
        assert!(parse(&["--max-workers", "1", "--chunk-size", "256"]).is_ok());
    }
}
