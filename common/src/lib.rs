//! The `common` crate provides the pieces shared between the bootstrap library and its
//! command line front end: logging setup, redaction of secrets in debug output and
//! back off timing.

pub mod clap;
pub mod throttle;
pub mod tracing;
