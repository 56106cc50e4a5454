pub mod forward;
pub mod server;

pub use server::{mitm_server_config, run, ProxyCtx};
