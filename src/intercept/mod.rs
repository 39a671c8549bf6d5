//! Request interception: origin filtering, classification, and the two caching strategies.

mod cache_first;
mod interceptor;
mod network_first;
mod policy;

pub use interceptor::Interceptor;
pub use policy::PolicySelector;
