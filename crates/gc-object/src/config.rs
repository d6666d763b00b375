//! Collector configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `GC_OBJECT_SCAN_STACK` | Scan registered threads' stacks for roots | true |
//! | `GC_OBJECT_COLLECT_THRESHOLD` | Bytes allocated between automatic collections (0 = never) | 4194304 (4MB) |
//! | `GC_OBJECT_MAX_HEAP_SIZE` | Maximum mapped heap size in bytes (0 = unlimited) | 0 |
//! | `GC_OBJECT_FINALIZE_ON_DEMAND` | Queue finalizers until `invoke_finalizers` is called | false |
//!
//! # Example
//!
//! ```
//! use gc_object::GcConfig;
//!
//! let config = GcConfig::builder()
//!     .scan_stack(false)
//!     .collect_threshold(0)
//!     .build()
//!     .unwrap();
//! assert!(!config.scan_stack);
//! ```

use std::env;

use crate::error::ConfigError;

/// Environment variable for [`GcConfig::scan_stack`].
pub const ENV_SCAN_STACK: &str = "GC_OBJECT_SCAN_STACK";
/// Environment variable for [`GcConfig::collect_threshold`].
pub const ENV_COLLECT_THRESHOLD: &str = "GC_OBJECT_COLLECT_THRESHOLD";
/// Environment variable for [`GcConfig::max_heap_size`].
pub const ENV_MAX_HEAP_SIZE: &str = "GC_OBJECT_MAX_HEAP_SIZE";
/// Environment variable for [`GcConfig::finalize_on_demand`].
pub const ENV_FINALIZE_ON_DEMAND: &str = "GC_OBJECT_FINALIZE_ON_DEMAND";

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Park every registered thread and scan its registers and stack for
    /// roots.
    /// Default: true.
    pub scan_stack: bool,

    /// Bytes allocated since the last collection that trigger an automatic
    /// collection. 0 disables automatic collection.
    /// Default: 4MB.
    pub collect_threshold: usize,

    /// Maximum bytes the heap may map. 0 means unlimited (default).
    pub max_heap_size: usize,

    /// Queue ready finalizers instead of running them at the end of a
    /// collection.
    /// Default: false.
    pub finalize_on_demand: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            scan_stack: true,
            collect_threshold: 4 * 1024 * 1024, // 4 MB
            max_heap_size: 0,                   // Unlimited
            finalize_on_demand: false,
        }
    }
}

impl GcConfig {
    /// Create a builder starting from default values.
    #[must_use]
    pub fn builder() -> GcConfigBuilder {
        GcConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set use default values. Invalid values are
    /// logged as warnings and the default is kept.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        match parse_env_bool(ENV_SCAN_STACK) {
            Ok(Some(val)) => config.scan_stack = val,
            Ok(None) => {}
            Err(err) => warn_invalid(&err),
        }

        match parse_env_usize(ENV_COLLECT_THRESHOLD) {
            Ok(Some(val)) => config.collect_threshold = val,
            Ok(None) => {}
            Err(err) => warn_invalid(&err),
        }

        match parse_env_usize(ENV_MAX_HEAP_SIZE) {
            Ok(Some(val)) => config.max_heap_size = val,
            Ok(None) => {}
            Err(err) => warn_invalid(&err),
        }

        match parse_env_bool(ENV_FINALIZE_ON_DEMAND) {
            Ok(Some(val)) => config.finalize_on_demand = val,
            Ok(None) => {}
            Err(err) => warn_invalid(&err),
        }

        if let Err(err) = config.validate() {
            warn_invalid(&err);
            config.max_heap_size = 0;
        }

        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_heap_size` is non-zero but smaller than one
    /// heap page.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size != 0 && self.max_heap_size < crate::heap::PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "max_heap_size".into(),
                message: format!("must be 0 or at least {} bytes", crate::heap::PAGE_SIZE),
            });
        }
        Ok(())
    }
}

/// Builder for [`GcConfig`].
#[derive(Debug, Clone, Default)]
pub struct GcConfigBuilder {
    config: GcConfig,
}

impl GcConfigBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable stack scanning.
    #[must_use]
    pub const fn scan_stack(mut self, enabled: bool) -> Self {
        self.config.scan_stack = enabled;
        self
    }

    /// Set the automatic collection threshold in bytes (0 disables it).
    #[must_use]
    pub const fn collect_threshold(mut self, bytes: usize) -> Self {
        self.config.collect_threshold = bytes;
        self
    }

    /// Set the maximum heap size in bytes (0 means unlimited).
    #[must_use]
    pub const fn max_heap_size(mut self, bytes: usize) -> Self {
        self.config.max_heap_size = bytes;
        self
    }

    /// Queue finalizers until they are explicitly invoked.
    #[must_use]
    pub const fn finalize_on_demand(mut self, enabled: bool) -> Self {
        self.config.finalize_on_demand = enabled;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// See [`GcConfig::validate`].
    pub fn build(self) -> Result<GcConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    #[must_use]
    pub fn build_unchecked(self) -> GcConfig {
        self.config
    }
}

fn warn_invalid(err: &ConfigError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(error = %err, "ignoring invalid gc configuration");
    #[cfg(not(feature = "tracing"))]
    let _ = err;
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|_| ConfigError::EnvParse {
        var: name.into(),
        value: raw,
    })
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::EnvParse {
            var: name.into(),
            value: raw,
        }),
    }
}
