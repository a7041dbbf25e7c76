use std::{io, net::SocketAddr};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

use crate::app::{
    relay::{relay, Duplex, Session},
    socks5,
    transport::{TcpOptions, TunnelConnector},
    ClientConfig,
};

/// Local SOCKSv5 entrance of the tunnel.
///
/// Setup is strictly serial: a tunnel is dialed first, then the next local
/// connection is accepted and paired with it. Either step failing ends the
/// whole service. Established sessions run on their own tasks.
#[derive(Debug)]
pub(crate) struct ClientService<C> {
    listener: TcpListener,
    connector: C,
    tcp_options: TcpOptions,
}

impl<C: TunnelConnector> ClientService<C> {
    pub(crate) async fn bind(config: &ClientConfig, connector: C) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self {
            listener,
            connector,
            tcp_options: TcpOptions::new(config.tcp_keepalive),
        })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Only returns on a fatal error.
    pub(crate) async fn serve(self) -> anyhow::Result<()> {
        let addr = self.local_addr().context("listener lost its address")?;
        info!("SOCKSv5 proxy listening on {}", addr);
        loop {
            let tunnel = self
                .connector
                .connect()
                .await
                .context("failed to establish tunnel to relay server")?;
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("failed to accept local connection")?;
            if let Err(err) = self.tcp_options.apply(&stream) {
                debug!("Failed to set socket options for {}: {}", peer, err);
            }
            tokio::spawn(handle_local(stream, peer, tunnel));
        }
    }
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_local<T: Duplex>(mut stream: TcpStream, peer: SocketAddr, tunnel: T) {
    let session = Session::new(peer);
    info!("Got a connection to our proxy: {}", session);
    match socks5::handshake(&mut stream).await {
        Ok(request) => info!("{} wants to connect to {}", session, request),
        Err(err) => {
            info!("{} SOCKSv5 handshake failed: {}", session, err);
            // Both the local connection and the unused tunnel are dropped here
            return;
        }
    }
    relay(&session, stream, tunnel).await;
}
