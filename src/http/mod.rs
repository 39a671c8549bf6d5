//! HTTP request/response descriptors and the network fetch primitive.

mod client;
mod fallback;
mod types;

#[cfg(test)]
pub mod testing;

pub use client::{Fetch, HttpFetcher};
pub use fallback::offline_response;
pub use types::{Request, Response};
