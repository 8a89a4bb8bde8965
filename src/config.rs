//! Process-wide settings, fixed at start-up.  Hosts either deserialize
//! a [`Config`] (e.g., with [`Config::from_json`]) or assemble one
//! with a [`ConfigBuilder`].
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::handle_pool::DEFAULT_OPEN_ATTEMPTS;
use crate::object_pool::DEFAULT_MAX_OPEN_STREAMS;
use crate::sweep::DEFAULT_SWEEP_PERIOD;

pub const DEFAULT_CACHE_ATTEMPTS: u32 = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 64;

/// How cache writes are kept from duplicating work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleFlight {
    /// One cache write at a time, process-wide.
    #[default]
    Global,
    /// One cache write at a time per item; different items are written
    /// concurrently.
    PerItem,
}

fn default_max_open_streams() -> usize {
    DEFAULT_MAX_OPEN_STREAMS
}

fn default_cache_attempts() -> u32 {
    DEFAULT_CACHE_ATTEMPTS
}

fn default_open_attempts() -> u32 {
    DEFAULT_OPEN_ATTEMPTS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_thumbnail_size() -> u32 {
    DEFAULT_THUMBNAIL_SIZE
}

fn default_staging_sweep_period() -> u64 {
    DEFAULT_SWEEP_PERIOD
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the on-disk cache tree.
    pub output_root: PathBuf,
    /// Items larger than this many bytes are never cached.
    pub max_file_size: u64,
    #[serde(default = "default_max_open_streams")]
    pub max_open_streams: usize,
    /// Attempts at copying an item into the cache.
    #[serde(default = "default_cache_attempts")]
    pub cache_attempts: u32,
    /// Attempts at opening an entry when the container fails transiently.
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Thumbnails fit in a square of this many pixels.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
    #[serde(default)]
    pub single_flight: SingleFlight,
    /// Cache writes between sweeps of the staging directory.
    #[serde(default = "default_staging_sweep_period")]
    pub staging_sweep_period: u64,
}

impl Config {
    /// Parses a JSON configuration; only `output_root` and
    /// `max_file_size` are required.
    pub fn from_json(json: &str) -> Result<Config> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builds a [`Config`] with defaults for everything but the cache root
/// and the maximum file size.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(output_root: impl AsRef<Path>, max_file_size: u64) -> Self {
        ConfigBuilder {
            config: Config {
                output_root: output_root.as_ref().to_owned(),
                max_file_size,
                max_open_streams: DEFAULT_MAX_OPEN_STREAMS,
                cache_attempts: DEFAULT_CACHE_ATTEMPTS,
                open_attempts: DEFAULT_OPEN_ATTEMPTS,
                chunk_size: DEFAULT_CHUNK_SIZE,
                thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
                single_flight: SingleFlight::Global,
                staging_sweep_period: DEFAULT_SWEEP_PERIOD,
            },
        }
    }

    /// Sets the ceiling on concurrently open streams.  The object pool
    /// treats zero as one.
    pub fn max_open_streams(mut self, max_open_streams: usize) -> Self {
        self.config.max_open_streams = max_open_streams;
        self
    }

    pub fn cache_attempts(mut self, attempts: u32) -> Self {
        self.config.cache_attempts = attempts;
        self
    }

    pub fn open_attempts(mut self, attempts: u32) -> Self {
        self.config.open_attempts = attempts;
        self
    }

    /// Sets the size of each read when copying into the cache.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn thumbnail_size(mut self, pixels: u32) -> Self {
        self.config.thumbnail_size = pixels;
        self
    }

    pub fn single_flight(mut self, mode: SingleFlight) -> Self {
        self.config.single_flight = mode;
        self
    }

    pub fn staging_sweep_period(mut self, writes: u64) -> Self {
        self.config.staging_sweep_period = writes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
