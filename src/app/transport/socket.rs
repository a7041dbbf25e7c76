use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::trace;

/// Options set on every TCP socket we accept or dial.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TcpOptions {
    pub(crate) keepalive: Option<Duration>,
}

impl TcpOptions {
    pub(crate) fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if let Some(time) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
            trace!("Keep-alive {:?} on {:?}", time, stream.peer_addr());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn apply_keepalive_and_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = stream.unwrap();

        TcpOptions::new(Some(Duration::from_secs(30)))
            .apply(&stream)
            .unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
