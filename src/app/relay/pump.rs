use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{traffic::Direction, Duplex, Session};

const BUF_SIZE: usize = 16 * 1024;
/// How long a finished direction may spend shutting its sink down.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Pump bytes between `local` and `remote` until either direction stops.
///
/// Each direction runs on its own task. The first one to finish, for
/// whatever reason, cancels the session; the other one observes that and
/// stops as well. Returns once both tasks are gone, by which time both
/// endpoints have been shut down and dropped.
#[instrument(skip_all, fields(session = session.id()))]
pub(crate) async fn relay<L, R>(session: &Arc<Session>, local: L, remote: R)
where
    L: Duplex,
    R: Duplex,
{
    let (local_rx, local_tx) = tokio::io::split(local);
    let (remote_rx, remote_tx) = tokio::io::split(remote);

    let upstream = tokio::spawn(pump(
        session.clone(),
        Direction::Upstream,
        local_rx,
        remote_tx,
    ));
    let downstream = tokio::spawn(pump(
        session.clone(),
        Direction::Downstream,
        remote_rx,
        local_tx,
    ));

    session.finished().await;
    trace!("{} cancelled, waiting for both directions", session);
    for (direction, task) in [
        (Direction::Upstream, upstream),
        (Direction::Downstream, downstream),
    ] {
        if let Err(err) = task.await {
            warn!("{} {} task failed: {}", session, direction, err);
        }
    }
    debug!("{} relay done, {}", session, session.traffic());
}

async fn pump<R, W>(session: Arc<Session>, direction: Direction, mut src: R, mut dst: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        result = copy(&session, direction, &mut src, &mut dst) => Some(result),
        _ = session.cancelled() => None,
    };
    session.cancel();
    match result {
        Some(Ok(bytes)) => debug!("{} {} closed after {} bytes", session, direction, bytes),
        Some(Err(err)) => info!("{} {} error: {}", session, direction, err),
        None => trace!("{} {} stopped", session, direction),
    }
    match timeout(CLOSE_GRACE, dst.shutdown()).await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => trace!("{} {} shutdown: {}", session, direction, err),
        Err(_) => debug!("{} {} shutdown timed out", session, direction),
    }
}

async fn copy<R, W>(
    session: &Session,
    direction: Direction,
    src: &mut R,
    dst: &mut W,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        // Message-based sinks (WebSocket) hold data until flushed.
        dst.flush().await?;
        session.add_traffic(direction, n);
        total += n as u64;
    }
}
