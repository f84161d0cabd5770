//! Runtime configuration.
//!
//! Configuration is built once, before the runtime starts, and shared into
//! the components that need a slice of it. Nothing reads global setters
//! after startup.

use std::collections::HashSet;

use crate::shadow::ShadowConfig;
use crate::stack::{StackId, MAX_NUM_FRAMES};
use crate::util::size::mb;

/// Environment variable read by [`RuntimeConfig::from_env`].
pub const OPTIONS_ENV_VAR: &str = "SHADOWHEAP_OPTIONS";

/// Settings consumed by each [`HeapProxy`](crate::HeapProxy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Byte cap on the quarantine of freed blocks.
    pub quarantine_size: usize,

    /// Extra bytes placed between user data and the trailer, widening the
    /// right redzone.
    pub trailer_padding_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            quarantine_size: mb(16),
            trailer_padding_size: 0,
        }
    }
}

/// Settings consumed by the [`StackCaptureCache`](crate::StackCaptureCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackCacheConfig {
    /// Frames to drop from the outermost end of every captured stack.
    pub bottom_frames_to_skip: usize,

    /// Depth cap of interned stack traces.
    pub max_num_frames: usize,

    /// Log compression statistics every this many saves (0 = never).
    pub compression_reporting_period: usize,
}

impl Default for StackCacheConfig {
    fn default() -> Self {
        Self {
            bottom_frames_to_skip: 0,
            max_num_frames: MAX_NUM_FRAMES,
            compression_reporting_period: 0,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Byte cap on each heap's quarantine (default: 16 MiB)
    pub quarantine_size: usize,

    /// Extra right-redzone bytes per block (default: 0)
    pub trailer_padding_size: usize,

    /// Outermost frames dropped from captured stacks (default: 0)
    pub bottom_frames_to_skip: usize,

    /// Maximum depth of captured stacks (default: 62)
    pub max_num_frames: usize,

    /// Stack-cache statistics logging period (0 = never)
    pub compression_reporting_period: usize,

    /// Crash stack ids whose errors are not reported
    pub ignored_stack_ids: HashSet<StackId>,

    /// Terminate the process after reporting an error
    pub exit_on_failure: bool,

    /// Ask the logger for a minidump on every error
    pub minidump_on_failure: bool,

    /// Render error reports as text through the logger
    pub log_as_text: bool,

    /// Monitored address range
    pub shadow: ShadowConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let heap = HeapConfig::default();
        let cache = StackCacheConfig::default();
        Self {
            quarantine_size: heap.quarantine_size,
            trailer_padding_size: heap.trailer_padding_size,
            bottom_frames_to_skip: cache.bottom_frames_to_skip,
            max_num_frames: cache.max_num_frames,
            compression_reporting_period: cache.compression_reporting_period,
            ignored_stack_ids: HashSet::new(),
            exit_on_failure: false,
            minidump_on_failure: false,
            log_as_text: true,
            shadow: ShadowConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration suited to tests: small quarantine, errors
    /// never terminate the process.
    pub fn minimal() -> Self {
        Self::default().with_quarantine_size(mb(1))
    }

    /// Heap slice of this configuration.
    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            quarantine_size: self.quarantine_size,
            trailer_padding_size: self.trailer_padding_size,
        }
    }

    /// Stack-cache slice of this configuration.
    pub fn stack_cache_config(&self) -> StackCacheConfig {
        StackCacheConfig {
            bottom_frames_to_skip: self.bottom_frames_to_skip,
            max_num_frames: self.max_num_frames.clamp(1, MAX_NUM_FRAMES),
            compression_reporting_period: self.compression_reporting_period,
        }
    }

    /// Builder pattern: set quarantine size.
    pub fn with_quarantine_size(mut self, size: usize) -> Self {
        self.quarantine_size = size;
        self
    }

    /// Builder pattern: set trailer padding size.
    pub fn with_trailer_padding_size(mut self, size: usize) -> Self {
        self.trailer_padding_size = size;
        self
    }

    /// Builder pattern: set bottom frames to skip.
    pub fn with_bottom_frames_to_skip(mut self, frames: usize) -> Self {
        self.bottom_frames_to_skip = frames;
        self
    }

    /// Builder pattern: set maximum stack depth.
    pub fn with_max_num_frames(mut self, frames: usize) -> Self {
        self.max_num_frames = frames;
        self
    }

    /// Builder pattern: set compression reporting period.
    pub fn with_compression_reporting_period(mut self, period: usize) -> Self {
        self.compression_reporting_period = period;
        self
    }

    /// Builder pattern: ignore errors raised from a crash stack.
    pub fn with_ignored_stack_id(mut self, id: StackId) -> Self {
        self.ignored_stack_ids.insert(id);
        self
    }

    /// Builder pattern: exit on failure.
    pub fn with_exit_on_failure(mut self, enable: bool) -> Self {
        self.exit_on_failure = enable;
        self
    }

    /// Builder pattern: minidump on failure.
    pub fn with_minidump_on_failure(mut self, enable: bool) -> Self {
        self.minidump_on_failure = enable;
        self
    }

    /// Builder pattern: text reports.
    pub fn with_log_as_text(mut self, enable: bool) -> Self {
        self.log_as_text = enable;
        self
    }

    /// Builder pattern: shadow configuration.
    pub fn with_shadow(mut self, shadow: ShadowConfig) -> Self {
        self.shadow = shadow;
        self
    }

    /// Parse a whitespace-separated option string on top of the defaults.
    ///
    /// Recognized options: `--quarantine_size=N`, `--trailer_padding_size=N`,
    /// `--bottom_frames_to_skip=N`, `--max_num_frames=N`,
    /// `--compression_reporting_period=N`, `--ignored_stack_ids=0xA;0xB`,
    /// `--exit_on_failure`, `--minidump_on_failure` and `--no_log_as_text`.
    pub fn parse_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for token in options.split_whitespace() {
            let option = token
                .strip_prefix("--")
                .ok_or_else(|| ConfigError::UnknownOption(token.to_owned()))?;
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (option, None),
            };

            match name {
                "quarantine_size" => config.quarantine_size = parse_size(name, value)?,
                "trailer_padding_size" => config.trailer_padding_size = parse_size(name, value)?,
                "bottom_frames_to_skip" => config.bottom_frames_to_skip = parse_size(name, value)?,
                "max_num_frames" => config.max_num_frames = parse_size(name, value)?,
                "compression_reporting_period" => {
                    config.compression_reporting_period = parse_size(name, value)?
                }
                "ignored_stack_ids" => {
                    let value = require_value(name, value)?;
                    for id in value.split(';').filter(|s| !s.is_empty()) {
                        config.ignored_stack_ids.insert(parse_stack_id(name, id)?);
                    }
                }
                "exit_on_failure" => config.exit_on_failure = parse_switch(name, value)?,
                "minidump_on_failure" => config.minidump_on_failure = parse_switch(name, value)?,
                "no_log_as_text" => config.log_as_text = !parse_switch(name, value)?,
                _ => return Err(ConfigError::UnknownOption(token.to_owned())),
            }
        }

        Ok(config)
    }

    /// Build the configuration from `SHADOWHEAP_OPTIONS`.
    ///
    /// A missing variable yields the defaults. A malformed one is logged and
    /// the defaults are kept.
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV_VAR) {
            Ok(options) => Self::parse_options(&options).unwrap_or_else(|err| {
                log::error!("unable to parse {}=\"{}\": {}", OPTIONS_ENV_VAR, options, err);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

fn require_value<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingValue(name.to_owned()))
}

fn parse_size(name: &str, value: Option<&str>) -> Result<usize, ConfigError> {
    let value = require_value(name, value)?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        option: name.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_switch(name: &str, value: Option<&str>) -> Result<bool, ConfigError> {
    match value {
        None => Ok(true),
        Some(value) => Err(ConfigError::UnexpectedValue {
            option: name.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn parse_stack_id(name: &str, value: &str) -> Result<StackId, ConfigError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16)
        .map(StackId)
        .map_err(|_| ConfigError::InvalidValue {
            option: name.to_owned(),
            value: value.to_owned(),
        })
}

/// Errors from parsing an option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The token is not a recognized `--option`.
    UnknownOption(String),
    /// A valued option was given without `=value`.
    MissingValue(String),
    /// A switch was given a value.
    UnexpectedValue { option: String, value: String },
    /// The value could not be parsed.
    InvalidValue { option: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownOption(token) => write!(f, "unknown option: {}", token),
            ConfigError::MissingValue(option) => write!(f, "option --{} requires a value", option),
            ConfigError::UnexpectedValue { option, value } => {
                write!(f, "option --{} takes no value (got \"{}\")", option, value)
            }
            ConfigError::InvalidValue { option, value } => {
                write!(f, "invalid value for --{}: \"{}\"", option, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.quarantine_size, mb(16));
        assert_eq!(config.max_num_frames, MAX_NUM_FRAMES);
        assert!(config.log_as_text);
        assert!(!config.exit_on_failure);
        assert!(config.ignored_stack_ids.is_empty());
    }

    #[test]
    fn test_parse_all_options() {
        let config = RuntimeConfig::parse_options(
            "--quarantine_size=1024 --trailer_padding_size=32 --bottom_frames_to_skip=2 \
             --max_num_frames=20 --compression_reporting_period=100 \
             --ignored_stack_ids=0xBADF00D;0xDEADBEEF \
             --exit_on_failure --minidump_on_failure --no_log_as_text",
        )
        .unwrap();

        assert_eq!(config.quarantine_size, 1024);
        assert_eq!(config.trailer_padding_size, 32);
        assert_eq!(config.bottom_frames_to_skip, 2);
        assert_eq!(config.max_num_frames, 20);
        assert_eq!(config.compression_reporting_period, 100);
        assert!(config.ignored_stack_ids.contains(&StackId(0x0BAD_F00D)));
        assert!(config.ignored_stack_ids.contains(&StackId(0xDEAD_BEEF)));
        assert!(config.exit_on_failure);
        assert!(config.minidump_on_failure);
        assert!(!config.log_as_text);
    }

    #[test]
    fn test_empty_string_is_default() {
        assert_eq!(RuntimeConfig::parse_options("  ").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            RuntimeConfig::parse_options("--quarantine_size=big"),
            Err(ConfigError::InvalidValue {
                option: "quarantine_size".into(),
                value: "big".into()
            })
        );
        assert!(matches!(
            RuntimeConfig::parse_options("--bogus"),
            Err(ConfigError::UnknownOption(_))
        ));
        assert!(matches!(
            RuntimeConfig::parse_options("--max_num_frames"),
            Err(ConfigError::MissingValue(_))
        ));
        assert!(matches!(
            RuntimeConfig::parse_options("--exit_on_failure=1"),
            Err(ConfigError::UnexpectedValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::parse_options("--ignored_stack_ids=0xZZ"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_slices() {
        let config = RuntimeConfig::default()
            .with_quarantine_size(4096)
            .with_trailer_padding_size(16)
            .with_max_num_frames(1000);

        assert_eq!(
            config.heap_config(),
            HeapConfig {
                quarantine_size: 4096,
                trailer_padding_size: 16
            }
        );
        assert_eq!(config.stack_cache_config().max_num_frames, MAX_NUM_FRAMES);
    }
}
