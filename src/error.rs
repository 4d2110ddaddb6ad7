//! Typed error taxonomy for conditions callers are expected to match on.
//!
//! Most fallible paths propagate `anyhow::Error` with context; these enums
//! exist for the conditions the CLI reports as plain user-facing messages
//! (bad configuration, unsupported backend operations) rather than as
//! unexpected failures.

use thiserror::Error;

/// Configuration problems. Fatal to the current command, not to the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A profile is missing a field the requested operation needs.
    #[error("profile \"{profile}\" is missing required field \"{field}\"")]
    MissingField { profile: String, field: String },

    /// The instance name has no profile in the config file.
    #[error("no profile named \"{0}\" in config")]
    UnknownProfile(String),

    /// A package entry names a source tag outside the supported set.
    #[error("invalid package source \"{0}\" (expected apt, pip, github, local, or sh)")]
    UnknownSource(String),

    /// A volume names a storage provider tag with no registered handler.
    #[error("unknown volume provider \"{0}\"")]
    UnknownVolumeProvider(String),

    /// A profile declares neither an AMI nor a launch template.
    #[error("profile \"{0}\" needs either \"ami\" or \"launch_template\"")]
    LaunchSource(String),

    /// The config file declares no compute backend at all.
    #[error("no backend configured (add an \"aws\" section or \"local\" hostnames)")]
    NoBackend,
}

impl ConfigError {
    /// Shorthand for the common missing-field case.
    pub fn missing(profile: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField { profile: profile.into(), field: field.into() }
    }
}

/// Provider-side conditions distinct from plain request failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend has no meaningful implementation of this operation
    /// (e.g. stopping a local host). Reported, never silently succeeds.
    #[error("operation \"{op}\" is not supported by the {backend} backend")]
    Unsupported { backend: &'static str, op: &'static str },
}
