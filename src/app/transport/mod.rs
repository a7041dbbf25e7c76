mod connector;
mod dialer;
mod proxy;
mod resolver;
mod socket;
mod ws;

pub(crate) use connector::{TunnelConnector, WsConnector};
pub(crate) use socket::TcpOptions;
pub(crate) use ws::{accept as accept_ws, WsStream};
