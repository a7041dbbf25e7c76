use std::{
    fmt::{Display, Formatter},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use super::traffic::{AtomicTraffic, Direction, Traffic};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One relayed connection, from accept (or upgrade) to teardown.
///
/// The cancellation token is one-shot: whichever relay direction finishes
/// first triggers it, and everything else belonging to the session observes
/// it and winds down. The session is closed once the last clone is dropped.
#[derive(Debug)]
pub(crate) struct Session {
    id: u64,
    peer: SocketAddr,
    cancel: CancellationToken,
    created_at: Instant,
    traffic: AtomicTraffic,
}

impl Display for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session #{} ({})", self.id, self.peer)
    }
}

impl Session {
    pub(crate) fn new(peer: SocketAddr) -> Arc<Self> {
        let session = Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            cancel: Default::default(),
            created_at: Instant::now(),
            traffic: Default::default(),
        };
        debug!("Open {}", session);
        session.into()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Wait until the session has been cancelled by any party.
    pub(crate) async fn finished(&self) {
        self.cancel.cancelled().await
    }

    pub(super) fn add_traffic(&self, direction: Direction, bytes: usize) {
        self.traffic.add(direction, bytes);
    }

    pub(crate) fn traffic(&self) -> Traffic {
        self.traffic.get()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        debug!(
            "Close {}, {:#?}, {}",
            self,
            self.created_at.elapsed(),
            self.traffic.get()
        );
    }
}
