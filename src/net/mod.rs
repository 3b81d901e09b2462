//! Network retrieval for intercepted requests.

mod client;
mod types;

use color_eyre::Result;
use std::future::Future;

pub use client::HttpNetwork;
pub use types::{Request, Response};

/// Something that can perform a live network fetch.
///
/// Any error means "the network failed"; callers don't distinguish timeouts,
/// DNS failures or an offline host.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}
