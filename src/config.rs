//! TOML-backed configuration for [`crate::Producer`] and [`crate::Consumer`].

use std::fs;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AmiError, AmiResult};

const DEFAULT_SHARDS_COUNT: u32 = 10;
const DEFAULT_PENDING_BUFFER_SIZE: usize = 10_000_000;
const DEFAULT_PIPE_BUFFER_SIZE: usize = 50_000;
const DEFAULT_PIPE_PERIOD_MICROS: u64 = 1_000;
const DEFAULT_PREFETCH_COUNT: i64 = 100;

/// Minimum `response_timeout`/`connection_timeout` the library enforces on the underlying
/// Redis client: large pipelined batches demand generous round-trip budgets.
pub const MIN_STORE_TIMEOUT: Duration = Duration::from_secs(30);

fn default_shards_count() -> u32 {
    DEFAULT_SHARDS_COUNT
}

fn default_pending_buffer_size() -> usize {
    DEFAULT_PENDING_BUFFER_SIZE
}

fn default_pipe_buffer_size() -> usize {
    DEFAULT_PIPE_BUFFER_SIZE
}

fn default_pipe_period_micros() -> u64 {
    DEFAULT_PIPE_PERIOD_MICROS
}

fn default_prefetch_count() -> i64 {
    DEFAULT_PREFETCH_COUNT
}

/// Top-level config file shape: `[producer]` and/or `[consumer]` tables plus the shared
/// `redis_url` used to build the store connection. Either table may be omitted if the process
/// only runs one side of the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct AmiConfig {
    pub redis_url: String,
    pub producer: Option<ProducerOptions>,
    pub consumer: Option<ConsumerOptions>,
}

impl AmiConfig {
    pub fn load(path: &str) -> AmiResult<Self> {
        let contents = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&contents)?;
        if let Some(p) = &cfg.producer {
            p.validate()?;
        }
        if let Some(c) = &cfg.consumer {
            c.validate()?;
        }
        Ok(cfg)
    }
}

/// Options for [`crate::Producer`]. Defaults: `shards_count: 10, pending_buffer_size:
/// 10_000_000, pipe_buffer_size: 50_000, pipe_period: 1ms`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerOptions {
    /// Queue name. Producers and consumers of the same logical queue must agree on this.
    pub name: String,

    /// Number of shard streams the queue is spread across. Bigger spreads better across
    /// cluster nodes but costs more memory; identical value required across all
    /// producers/consumers of a queue.
    #[serde(default = "default_shards_count")]
    pub shards_count: u32,

    /// Intake channel capacity. Bigger risks losing more on an unflushed crash.
    #[serde(default = "default_pending_buffer_size")]
    pub pending_buffer_size: usize,

    /// Max messages per pipelined `XADD` transaction.
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    /// Max time between flushes when the intake is otherwise idle.
    #[serde(default = "default_pipe_period_micros")]
    pub pipe_period_micros: u64,
}

impl ProducerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shards_count: DEFAULT_SHARDS_COUNT,
            pending_buffer_size: DEFAULT_PENDING_BUFFER_SIZE,
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            pipe_period_micros: DEFAULT_PIPE_PERIOD_MICROS,
        }
    }

    pub fn shards_count(mut self, n: u32) -> Self {
        self.shards_count = n;
        self
    }

    pub fn pending_buffer_size(mut self, n: usize) -> Self {
        self.pending_buffer_size = n;
        self
    }

    pub fn pipe_buffer_size(mut self, n: usize) -> Self {
        self.pipe_buffer_size = n;
        self
    }

    pub fn pipe_period(mut self, d: Duration) -> Self {
        self.pipe_period_micros = d.as_micros().max(1) as u64;
        self
    }

    pub fn pipe_period_duration(&self) -> Duration {
        Duration::from_micros(self.pipe_period_micros)
    }

    pub fn validate(&self) -> AmiResult<()> {
        if self.name.is_empty() {
            return Err(AmiError::MissingConfig("producer.name"));
        }
        if self.shards_count == 0 {
            return Err(AmiError::InvalidConfig("producer.shards_count must be > 0".into()));
        }
        if self.pending_buffer_size == 0 {
            return Err(AmiError::InvalidConfig(
                "producer.pending_buffer_size must be > 0".into(),
            ));
        }
        if self.pipe_buffer_size == 0 {
            return Err(AmiError::InvalidConfig(
                "producer.pipe_buffer_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Options for [`crate::Consumer`]. Same buffering knobs as [`ProducerOptions`], plus a
/// mandatory unique `consumer` identity, `prefetch_count`, and `block`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerOptions {
    pub name: String,

    /// Unique consumer name per queue. A restarted consumer with the same name recovers its
    /// pending entries from a prior crash; two simultaneously-live consumers with the same name
    /// race for the same entries and the store rejects the second ack.
    pub consumer: String,

    #[serde(default = "default_shards_count")]
    pub shards_count: u32,

    /// Maximum messages read from a single shard per `XREADGROUP`, and the delivery channel's
    /// capacity.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: i64,

    /// `BLOCK` argument in milliseconds. `None`/unset or `0` means the 1s default; negative
    /// disables blocking entirely; positive is used verbatim.
    #[serde(default)]
    pub block_millis: Option<i64>,

    #[serde(default = "default_pending_buffer_size")]
    pub pending_buffer_size: usize,

    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    #[serde(default = "default_pipe_period_micros")]
    pub pipe_period_micros: u64,
}

impl ConsumerOptions {
    pub fn new(name: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumer: consumer.into(),
            shards_count: DEFAULT_SHARDS_COUNT,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            block_millis: None,
            pending_buffer_size: DEFAULT_PENDING_BUFFER_SIZE,
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            pipe_period_micros: DEFAULT_PIPE_PERIOD_MICROS,
        }
    }

    pub fn shards_count(mut self, n: u32) -> Self {
        self.shards_count = n;
        self
    }

    pub fn prefetch_count(mut self, n: i64) -> Self {
        self.prefetch_count = n;
        self
    }

    pub fn block(mut self, d: Duration) -> Self {
        self.block_millis = Some(d.as_millis() as i64);
        self
    }

    pub fn no_block(mut self) -> Self {
        self.block_millis = Some(-1);
        self
    }

    pub fn pending_buffer_size(mut self, n: usize) -> Self {
        self.pending_buffer_size = n;
        self
    }

    pub fn pipe_buffer_size(mut self, n: usize) -> Self {
        self.pipe_buffer_size = n;
        self
    }

    pub fn pipe_period(mut self, d: Duration) -> Self {
        self.pipe_period_micros = d.as_micros().max(1) as u64;
        self
    }

    pub fn pipe_period_duration(&self) -> Duration {
        Duration::from_micros(self.pipe_period_micros)
    }

    /// Resolves `block_millis` to the effective `XREADGROUP BLOCK` argument: `None` means no
    /// `BLOCK` clause at all (indefinite/no-block read), `Some(ms)` is passed verbatim.
    pub fn effective_block_millis(&self) -> Option<i64> {
        match self.block_millis {
            None | Some(0) => Some(1_000),
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(ms),
        }
    }

    pub fn validate(&self) -> AmiResult<()> {
        if self.name.is_empty() {
            return Err(AmiError::MissingConfig("consumer.name"));
        }
        if self.consumer.is_empty() {
            return Err(AmiError::MissingConfig("consumer.consumer"));
        }
        if self.shards_count == 0 {
            return Err(AmiError::InvalidConfig("consumer.shards_count must be > 0".into()));
        }
        if self.pending_buffer_size == 0 {
            return Err(AmiError::InvalidConfig(
                "consumer.pending_buffer_size must be > 0".into(),
            ));
        }
        if self.pipe_buffer_size == 0 {
            return Err(AmiError::InvalidConfig(
                "consumer.pipe_buffer_size must be > 0".into(),
            ));
        }
        if self.prefetch_count <= 0 {
            return Err(AmiError::InvalidConfig("consumer.prefetch_count must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_resolution_matches_spec() {
        let mut opt = ConsumerOptions::new("q", "c");
        assert_eq!(opt.effective_block_millis(), Some(1_000));

        opt.block_millis = Some(0);
        assert_eq!(opt.effective_block_millis(), Some(1_000));

        opt.block_millis = Some(-1);
        assert_eq!(opt.effective_block_millis(), None);

        opt.block_millis = Some(5_000);
        assert_eq!(opt.effective_block_millis(), Some(5_000));
    }

    #[test]
    fn validate_rejects_missing_name() {
        let opt = ProducerOptions::new("");
        assert!(opt.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_shards() {
        let opt = ProducerOptions::new("q").shards_count(0);
        assert!(opt.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_consumer_name() {
        let opt = ConsumerOptions::new("q", "");
        assert!(opt.validate().is_err());
    }

    #[test]
    fn builder_methods_roundtrip() {
        let opt = ProducerOptions::new("q")
            .shards_count(3)
            .pipe_buffer_size(2)
            .pending_buffer_size(128)
            .pipe_period(Duration::from_millis(5));
        assert_eq!(opt.shards_count, 3);
        assert_eq!(opt.pipe_buffer_size, 2);
        assert_eq!(opt.pending_buffer_size, 128);
        assert_eq!(opt.pipe_period_duration(), Duration::from_millis(5));
    }
}
