use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use bytesize::ByteSize;

/// Which way bytes flow through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Local endpoint to remote endpoint.
    Upstream,
    /// Remote endpoint to local endpoint.
    Downstream,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => write!(f, "local->remote"),
            Direction::Downstream => write!(f, "remote->local"),
        }
    }
}

#[derive(Default, Debug)]
pub(crate) struct AtomicTraffic {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Traffic {
    pub(crate) tx_bytes: u64,
    pub(crate) rx_bytes: u64,
}

impl Display for Traffic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TX {}, RX {}",
            ByteSize(self.tx_bytes),
            ByteSize(self.rx_bytes)
        )
    }
}

impl AtomicTraffic {
    #[inline]
    pub(super) fn add(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::Upstream => &self.tx_bytes,
            Direction::Downstream => &self.rx_bytes,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> Traffic {
        Traffic {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_by_direction() {
        let traffic = AtomicTraffic::default();
        traffic.add(Direction::Upstream, 10);
        traffic.add(Direction::Downstream, 3);
        traffic.add(Direction::Upstream, 5);
        assert_eq!(
            traffic.get(),
            Traffic {
                tx_bytes: 15,
                rx_bytes: 3
            }
        );
        assert_eq!(traffic.get().to_string(), "TX 15 B, RX 3 B");
    }
}
