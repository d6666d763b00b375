//! Error types.

use std::fmt;

use crate::allocator::Strategy;

/// Why the collector could not supply a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailure {
    /// The operating system refused to map more pages.
    OutOfMemory,
    /// The configured `max_heap_size` would be exceeded.
    HeapLimit,
}

impl fmt::Display for AllocFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::HeapLimit => f.write_str("heap size limit reached"),
        }
    }
}

/// An allocation request the collector could not satisfy.
///
/// This is the only error the allocation layer reports. It is never retried
/// internally; callers should treat it like any other out-of-memory
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    size: usize,
    strategy: Strategy,
    reason: AllocFailure,
}

impl AllocError {
    pub(crate) const fn new(size: usize, strategy: Strategy, reason: AllocFailure) -> Self {
        Self {
            size,
            strategy,
            reason,
        }
    }

    /// Requested size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Strategy the request was made under.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Underlying cause.
    #[must_use]
    pub const fn reason(&self) -> AllocFailure {
        self.reason
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate {} bytes ({:?}): {}",
            self.size, self.strategy, self.reason
        )
    }
}

impl std::error::Error for AllocError {}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    EnvParse {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{field}': {message}")
            }
            Self::EnvParse { var, value } => {
                write!(f, "failed to parse environment variable '{var}': {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
