pub mod aggregator;
pub mod body;
pub mod server;

pub use aggregator::{Aggregator, RequestEvent};
