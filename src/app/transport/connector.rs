use std::{io::Result, sync::Arc};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{client_async_tls, MaybeTlsStream};
use tracing::{debug, instrument};
use url::Url;

use super::{
    dialer::Dialer,
    proxy::{url_host, UpstreamProxy},
    resolver::{DohResolver, Resolver, SystemResolver},
    socket::TcpOptions,
    ws::{into_io_error, WsStream},
};
use crate::app::{relay::Duplex, ClientConfig};

/// Produces a fresh tunnel to the relay server on every call.
#[async_trait]
pub(crate) trait TunnelConnector: Send + Sync + 'static {
    type Stream: Duplex;

    async fn connect(&self) -> Result<Self::Stream>;
}

/// Tunnels over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub(crate) struct WsConnector {
    url: Url,
    host: String,
    port: u16,
    dialer: Dialer,
    tcp_options: TcpOptions,
}

impl WsConnector {
    pub(crate) fn from_config(config: &ClientConfig) -> Result<Self> {
        let resolver: Arc<dyn Resolver> = match &config.doh {
            Some(url) => Arc::new(DohResolver::new(url.clone())?),
            None => Arc::new(SystemResolver),
        };
        let proxy = config
            .proxy
            .as_ref()
            .map(UpstreamProxy::from_url)
            .transpose()?;
        Self::new(
            config.url.clone(),
            Dialer::new(resolver, proxy),
            TcpOptions::new(config.tcp_keepalive),
        )
    }

    pub(crate) fn new(url: Url, dialer: Dialer, tcp_options: TcpOptions) -> Result<Self> {
        let host = match url_host(&url) {
            Some(host) => host,
            None => io_error!(InvalidInput, "Relay server URL without host: {}", url),
        };
        let port = match url.port_or_known_default() {
            Some(port) => port,
            None => io_error!(InvalidInput, "Relay server URL without port: {}", url),
        };
        Ok(Self {
            url,
            host,
            port,
            dialer,
            tcp_options,
        })
    }
}

#[async_trait]
impl TunnelConnector for WsConnector {
    type Stream = WsStream<MaybeTlsStream<TcpStream>>;

    #[instrument(skip_all, fields(url = %self.url))]
    async fn connect(&self) -> Result<Self::Stream> {
        let stream = self.dialer.connect(&self.host, self.port).await?;
        self.tcp_options.apply(&stream)?;
        let (ws, response) = client_async_tls(self.url.as_str(), stream)
            .await
            .map_err(into_io_error)?;
        debug!("Tunnel upgraded, HTTP {}", response.status());
        Ok(WsStream::new(ws))
    }
}
