//! Credential handling.
//!
//! SSRF protection for outbound URLs lives with the crawler trait
//! ([`crate::traits::UrlValidator`]).

pub mod credentials;

pub use credentials::{ServiceCredentials, SecretString};
