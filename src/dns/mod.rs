//! Forward resolution used by direct dials of synthetic targets.

mod system;

pub use system::SystemResolver;

use smallvec::SmallVec;
use std::net::SocketAddr;
use thiserror::Error;

/// Candidate addresses for one name, in resolver order.
pub type Candidates = SmallVec<[SocketAddr; 4]>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported hostname")]
    Unsupported,
    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Result<Candidates, ResolveError>;
}
