//! HTTP surface of the bridge

mod router;
mod server;

pub use router::{AppState, create_router};
pub use server::ProxyServer;
