//! Error type for the runtime's construction and startup surfaces.
//!
//! Failures inside the syscall shim are reported through the C errno
//! channel instead (see [`crate::hook`]), so that code written against the
//! shim behaves exactly like code written against the raw syscalls.

use std::io;

/// Errors surfaced by runtime constructors and configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value could not be parsed or evaluated.
    #[error("invalid configuration value for `{key}`: {reason}")]
    Config { key: String, reason: String },

    /// A coroutine stack could not be allocated.
    #[error("coroutine stack allocation failed ({size} bytes)")]
    StackAlloc { size: usize },

    /// An operating-system call failed during setup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
