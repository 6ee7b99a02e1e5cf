//! Credential Handling
//!
//! Password digests and constant-time verification for room access.

pub mod secret;
