mod pump;
mod session;
mod traffic;

use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) use pump::relay;
pub(crate) use session::Session;

/// A connected byte stream the relay can pump in both directions.
pub(crate) trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
