/// Index of a connection within a communicator's connection table.
pub type ConnId = u32;

/// Upper bound on connections per communicator.
pub const MAX_CONNECTIONS: usize = 64;

/// Which transport a proxy (and its connections) drives.
///
/// A P2P proxy moves data between GPUs on the same host over a CUDA
/// stream; an IB proxy posts RDMA work to an InfiniBand/RoCE queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    P2p,
    Ib,
}

impl TransportType {
    /// Short name used in thread names and logs.
    pub const fn name(self) -> &'static str {
        match self {
            TransportType::P2p => "p2p",
            TransportType::Ib => "ib",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        assert_eq!(TransportType::P2p.to_string(), "p2p");
        assert_eq!(TransportType::Ib.to_string(), "ib");
    }

    #[test]
    fn test_transport_distinct() {
        assert_ne!(TransportType::P2p, TransportType::Ib);
    }
}
