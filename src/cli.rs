use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::metadata::LevelFilter;
use url::Url;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct CliArgs {
    #[clap(subcommand)]
    pub(crate) role: Role,

    /// Level of logging verbosity [possible values: off, error, warn, info,
    /// debug, trace]
    #[clap(long, global = true)]
    #[clap(default_value = "info")]
    pub(crate) log_level: LevelFilter,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Role {
    /// Accept WebSocket tunnels on loopback and forward them to one backend
    Server(ServerArgs),
    /// Accept SOCKSv5 connections and carry each one over a new tunnel
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub(crate) struct ServerArgs {
    /// Read the server configuration from a TOML file instead
    #[clap(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Port number to listen on. Always bound on 127.0.0.1, put it behind
    /// the front (CDN, reverse proxy) that terminates TLS.
    #[clap(short = 'p', long, required_unless_present = "config")]
    pub(crate) port: Option<u16>,

    /// Address of the backend TCP service every tunnel is forwarded to
    #[clap(short = 'b', long, required_unless_present = "config")]
    pub(crate) backend: Option<String>,

    /// Idle time before TCP keep-alive probes are sent, e.g. "60s"
    #[clap(long)]
    #[clap(parse(try_from_str = parse_duration::parse))]
    pub(crate) tcp_keepalive: Option<Duration>,
}

#[derive(Args, Debug)]
pub(crate) struct ClientArgs {
    /// Read the client configuration from a TOML file instead
    #[clap(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Address to bind on for the local SOCKSv5 listener
    #[clap(short = 'l', long, default_value = "127.0.0.1:10888")]
    pub(crate) listen: SocketAddr,

    /// URL of the relay server, e.g. wss://cdn.example.com/ws
    #[clap(short = 'u', long, required_unless_present = "config")]
    pub(crate) url: Option<Url>,

    /// Proxy used to reach the relay server, e.g. socks5://127.0.0.1:1080
    /// or http://127.0.0.1:8080
    #[clap(short = 'x', long)]
    pub(crate) proxy: Option<Url>,

    /// DNS over HTTPS endpoint used to resolve the relay server, e.g.
    /// https://9.9.9.9/dns-query
    #[clap(long)]
    pub(crate) doh: Option<Url>,

    /// Idle time before TCP keep-alive probes are sent, e.g. "60s"
    #[clap(long)]
    #[clap(parse(try_from_str = parse_duration::parse))]
    pub(crate) tcp_keepalive: Option<Duration>,
}
