//! Outbound call governance: rate gate, retry policy, HTTP source.

mod http;
mod rate_limiter;
mod retry;

pub use http::*;
pub use rate_limiter::*;
pub use retry::*;
