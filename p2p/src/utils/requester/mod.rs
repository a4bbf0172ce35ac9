//! Make requests to peers limited by rate and prioritized by performance.
//!
//! Peers are ranked by an exponential moving average of their response time. Callers ask for
//! the best eligible peer, send it a request, and report back whether the request resolved,
//! timed out, or failed. Peers that time out, have nothing to give, or return invalid data can be
//! excluded for a while ([Requester::exclude]) or forever ([Requester::block]).

mod config;
mod metrics;
#[allow(clippy::module_inception)]
mod requester;

pub use config::Config;
pub use requester::{Error, Request, Requester, ID};
