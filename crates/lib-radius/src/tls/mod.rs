//! Glue between the TLS library's session-resumption callbacks and the
//! administrator's cache policy.

mod cache;

pub use cache::*;
