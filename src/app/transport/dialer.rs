use std::{
    io::{self, ErrorKind, Result},
    net::IpAddr,
    sync::Arc,
};

use derivative::Derivative;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::{proxy::UpstreamProxy, resolver::Resolver};

/// Opens TCP connections towards the relay server, either directly (via the
/// configured resolver) or through an upstream proxy.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub(crate) struct Dialer {
    #[derivative(Debug = "ignore")]
    resolver: Arc<dyn Resolver>,
    proxy: Option<UpstreamProxy>,
}

impl Dialer {
    pub(crate) fn new(resolver: Arc<dyn Resolver>, proxy: Option<UpstreamProxy>) -> Self {
        Self { resolver, proxy }
    }

    pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match &self.proxy {
            // The proxy resolves the host itself
            Some(proxy) => proxy.connect(host, port).await,
            None => self.connect_direct(host, port).await,
        }
    }

    #[instrument(skip(self))]
    async fn connect_direct(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.resolver.resolve(host).await?,
        };
        let mut last_err = None;
        for ip in addrs {
            match TcpStream::connect((ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("Failed to connect {}:{}: {}", ip, port, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("No address found for {}", host))
        }))
    }
}
