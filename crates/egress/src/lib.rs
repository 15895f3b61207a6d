//! Network egress policy enforcement: a host allowlist
//! matcher, an in-process HTTP transport wrapper, and a localhost
//! HTTP/CONNECT forward proxy for subprocess traffic.

pub mod domain;
pub mod enforcer;
pub mod proxy;

pub use domain::{DomainMatcher, in_container, is_localhost};
pub use enforcer::{EgressBlocked, EgressEnforcer, OnAttempt};
pub use proxy::{EgressProxy, RunningProxy};
