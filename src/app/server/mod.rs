use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, instrument, warn};

use crate::app::{
    context::WS_PATH,
    relay::{relay, Session},
    transport::{accept_ws, TcpOptions},
    ServerConfig,
};

/// Pause after a failed accept, so running out of descriptors does not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Terminates WebSocket tunnels and forwards each of them to the backend.
#[derive(Debug)]
pub(crate) struct ServerService {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    tcp_options: TcpOptions,
}

impl ServerService {
    /// Bind on loopback only; the front in front of us is the public side.
    pub(crate) async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await?;
        Ok(Self {
            tcp_options: TcpOptions::new(config.tcp_keepalive),
            config: config.into(),
            listener,
        })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub(crate) async fn serve(self) -> anyhow::Result<()> {
        let addr = self.local_addr().context("listener lost its address")?;
        info!("WebSocket server listening on {}{}", addr, WS_PATH);
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept connection: {}", err);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            };
            if let Err(err) = self.tcp_options.apply(&stream) {
                debug!("Failed to set socket options for {}: {}", peer, err);
            }
            tokio::spawn(handle_tunnel(stream, peer, self.config.clone(), self.tcp_options));
        }
    }
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_tunnel(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    tcp_options: TcpOptions,
) {
    let mut tunnel = match accept_ws(stream, WS_PATH).await {
        Ok(tunnel) => tunnel,
        Err(err) => {
            info!("WebSocket upgrade from {} failed: {}", peer, err);
            return;
        }
    };
    let session = Session::new(peer);
    info!("Got a connection to websocket server: {}", session);

    // Always the configured backend, whatever the client asked for.
    let backend = match TcpStream::connect(config.backend.as_str()).await {
        Ok(backend) => backend,
        Err(err) => {
            warn!(
                "{} cannot dial backend {}: {}",
                session, config.backend, err
            );
            if let Err(err) = tunnel.shutdown().await {
                debug!("{} close tunnel: {}", session, err);
            }
            return;
        }
    };
    if let Err(err) = tcp_options.apply(&backend) {
        debug!("{} failed to set backend socket options: {}", session, err);
    }
    debug!("{} connected backend {}", session, config.backend);

    relay(&session, tunnel, backend).await;
}
