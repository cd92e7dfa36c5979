//! Configuration for sqlkv
//!
//! Centralized configuration with sensible defaults. Options can be set
//! through the builder or parsed from `name=value` strings (the form the
//! CLI and connection strings carry them in).

use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::strategy::WriteMode;

/// Default table name for the append log
pub const DEFAULT_TABLE: &str = "kv_log";

/// Default number of inserts between compactions
pub const DEFAULT_COMPACT_FREQUENCY: u64 = 25;

/// Default flush timer interval
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(2500);

/// Main configuration for an Engine instance
#[derive(Debug, Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Table Configuration
    // -------------------------------------------------------------------------
    /// Name of the backing log table
    pub table: String,

    /// Column width hint for `key` (VARCHAR(n) instead of TEXT)
    pub key_size: Option<u32>,

    /// Column width hint for `value`
    pub value_size: Option<u32>,

    /// How writes land in the table (append log or upsert)
    pub write_mode: WriteMode,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Inserts between compactions
    pub compact_frequency: u64,

    /// Never compact the append log
    pub disable_compact: bool,

    // -------------------------------------------------------------------------
    // Write Buffer Configuration
    // -------------------------------------------------------------------------
    /// Pending ops held before a size-triggered flush (0 disables buffering)
    pub write_buffer_size: usize,

    /// Flush timer interval (zero disables the timer)
    pub max_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            key_size: None,
            value_size: None,
            write_mode: WriteMode::AppendLog,
            compact_frequency: DEFAULT_COMPACT_FREQUENCY,
            disable_compact: false,
            write_buffer_size: 0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Build options from `(name, value)` string pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = OptionsBuilder::default();
        for (name, value) in pairs {
            builder = builder.set(name.as_ref(), value.as_ref())?;
        }
        Ok(builder.build())
    }

    /// True when writes go through the write buffer
    pub fn buffering(&self) -> bool {
        self.write_buffer_size > 0
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Set the backing table name
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.options.table = table.into();
        self
    }

    /// Set the key column width hint
    pub fn key_size(mut self, size: u32) -> Self {
        self.options.key_size = Some(size);
        self
    }

    /// Set the value column width hint
    pub fn value_size(mut self, size: u32) -> Self {
        self.options.value_size = Some(size);
        self
    }

    /// Set the write strategy selection mode
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.options.write_mode = mode;
        self
    }

    /// Set the number of inserts between compactions
    pub fn compact_frequency(mut self, frequency: u64) -> Self {
        self.options.compact_frequency = frequency;
        self
    }

    /// Disable compaction of the append log
    pub fn disable_compact(mut self, disable: bool) -> Self {
        self.options.disable_compact = disable;
        self
    }

    /// Set the write buffer capacity (0 disables buffering)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.options.write_buffer_size = size;
        self
    }

    /// Set the flush timer interval
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.options.max_delay = delay;
        self
    }

    /// Set an option from its string form.
    ///
    /// Malformed numbers and booleans fall back to the default with a
    /// warning. Unknown names are rejected.
    pub fn set(mut self, name: &str, value: &str) -> Result<Self> {
        let defaults = Options::default();
        let value = value.trim();

        match name {
            "table" => {
                if value.is_empty() {
                    return Err(StoreError::Config("table name cannot be empty".to_string()));
                }
                self.options.table = value.to_string();
            }
            "compactFrequency" | "compact_frequency" => {
                self.options.compact_frequency =
                    parse_or_default(name, value, defaults.compact_frequency);
            }
            "disableCompact" | "disable_compact" => {
                self.options.disable_compact =
                    parse_bool_or_default(name, value, defaults.disable_compact);
            }
            "bulkBufferSize" | "writeBufferSize" | "write_buffer_size" => {
                self.options.write_buffer_size =
                    parse_or_default(name, value, defaults.write_buffer_size);
            }
            "maxDelay" | "max_delay" => {
                let millis = parse_or_default(name, value, defaults.max_delay.as_millis() as u64);
                self.options.max_delay = Duration::from_millis(millis);
            }
            "keySize" | "key_size" => {
                self.options.key_size = parse_size_hint(name, value);
            }
            "valueSize" | "value_size" => {
                self.options.value_size = parse_size_hint(name, value);
            }
            "writeMode" | "write_mode" => {
                self.options.write_mode = value.parse()?;
            }
            other => {
                return Err(StoreError::Config(format!("unknown option '{}'", other)));
            }
        }

        Ok(self)
    }

    pub fn build(mut self) -> Options {
        if self.options.compact_frequency == 0 {
            self.options.compact_frequency = DEFAULT_COMPACT_FREQUENCY;
        }
        self.options
    }
}

// =============================================================================
// Parsing Helpers
// =============================================================================

fn parse_or_default<T>(name: &str, value: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match value.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(option = name, value, %default, "malformed option, using default");
            default
        }
    }
}

fn parse_bool_or_default(name: &str, value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            tracing::warn!(option = name, value, default, "malformed option, using default");
            default
        }
    }
}

/// Column widths: 0 or garbage means "no hint"
fn parse_size_hint(name: &str, value: &str) -> Option<u32> {
    match parse_or_default(name, value, 0u32) {
        0 => None,
        size => Some(size),
    }
}
