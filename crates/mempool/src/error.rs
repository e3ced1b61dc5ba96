//! Recoverable errors for nebula-mempool
//!
//! Most misuse of the allocator is fatal (see the crate docs). The conditions
//! below are the ones a caller can reasonably handle.

use thiserror::Error;

// ============================================================================
// Main Error Types
// ============================================================================

/// Memory pool errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Configuration Errors ---
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- Arena Errors ---
    #[error("Arena exhausted while creating pool '{pool}': requested {requested} bytes, available {available}")]
    ArenaExhausted {
        pool: String,
        requested: usize,
        available: usize,
    },

    #[error("No static arena is configured")]
    NoArena,

    // --- System Errors ---
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },
}

impl MemoryError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ArenaExhausted { .. })
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::ArenaExhausted { .. } => "MEM:ARENA:EXHAUSTED",
            Self::NoArena => "MEM:ARENA:MISSING",
            Self::InvalidState { .. } => "MEM:SYSTEM:STATE",
        }
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create invalid config error
    pub fn invalid_config(reason: &str) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }

    /// Create arena exhausted error
    pub fn arena_exhausted(pool: &str, requested: usize, available: usize) -> Self {
        tracing::warn!(
            "Static arena exhausted by pool '{}': requested {} bytes, {} available",
            pool,
            requested,
            available
        );

        Self::ArenaExhausted {
            pool: pool.to_string(),
            requested,
            available,
        }
    }

    /// Create invalid state error
    pub fn invalid_state(reason: &str) -> Self {
        Self::InvalidState {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for memory pool operations
pub type MemoryResult<T> = Result<T, MemoryError>;

// ============================================================================
// Tests
// ============================================================================
