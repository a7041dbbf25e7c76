#[macro_use]
mod macros;

mod client;
mod context;
mod relay;
mod server;
mod socks5;
mod transport;

pub(crate) use client::ClientService;
pub(crate) use context::{ClientConfig, ServerConfig};
pub(crate) use server::ServerService;
pub(crate) use transport::WsConnector;
