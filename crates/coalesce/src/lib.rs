//! Request coalescing and pacing primitives.
//!
//! These primitives are shared by the server-side libraries to memoize
//! expensive or externally rate-limited computations (auth tokens, lookup
//! tables, downstream API responses), and to pace bursts of outgoing calls
//! against a single interval-limited resource.
//!
//! Currently there are:
//!
//! - an [`ExpiryCache`] that provides request coalescing and keeps entries
//!   in memory until their deadline passes,
//! - a [`OnceCache`] that evaluates an initializer at most once per key for
//!   the lifetime of the process,
//! - a [`RateLimiter`] that grants queued waiters strictly in arrival
//!   order, no faster than a fixed minimum interval between grants.
//!
//! All registries are explicit instances with caller-controlled lifetime:
//! construct them once at process start and pass them around by handle.
//! Every type here is cheaply `Clone` and shares its state.

#![warn(missing_docs)]

mod error;
mod expiry;
mod once;
mod rate_limit;

pub use error::*;
pub use expiry::*;
pub use once::*;
pub use rate_limit::*;
