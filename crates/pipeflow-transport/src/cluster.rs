//! Cluster bootstrap configuration.

use std::net::SocketAddr;

use pipeflow_core::Rank;

use crate::TransportError;

/// What every process of a cluster is started with.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This process's rank. Rank 0 is the Manager.
    pub rank: Rank,

    /// Total number of processes, Manager included.
    pub size: usize,

    /// Address the Manager listens on and Workers connect to.
    pub rendezvous: SocketAddr,
}

impl ClusterConfig {
    pub fn new(rank: Rank, size: usize, rendezvous: SocketAddr) -> Self {
        Self {
            rank,
            size,
            rendezvous,
        }
    }

    /// A cluster needs the Manager plus at least one Worker, and the rank
    /// must belong to it.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.size < 2 {
            return Err(TransportError::InvalidCluster(format!(
                "size must be at least 2 (one manager, one worker), got {}",
                self.size
            )));
        }
        if self.rank.get() as usize >= self.size {
            return Err(TransportError::InvalidCluster(format!(
                "rank {} outside cluster of size {}",
                self.rank, self.size
            )));
        }
        Ok(())
    }

    /// Whether `rank` is a worker rank of this cluster.
    pub fn contains_worker(&self, rank: Rank) -> bool {
        !rank.is_manager() && (rank.get() as usize) < self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7070".parse().unwrap()
    }

    #[test]
    fn test_validate() {
        assert!(ClusterConfig::new(Rank::MANAGER, 3, addr()).validate().is_ok());
        assert!(ClusterConfig::new(Rank::new(2), 3, addr()).validate().is_ok());
        assert!(ClusterConfig::new(Rank::new(3), 3, addr()).validate().is_err());
        assert!(ClusterConfig::new(Rank::MANAGER, 1, addr()).validate().is_err());
    }

    #[test]
    fn test_contains_worker() {
        let cluster = ClusterConfig::new(Rank::MANAGER, 3, addr());
        assert!(!cluster.contains_worker(Rank::MANAGER));
        assert!(cluster.contains_worker(Rank::new(2)));
        assert!(!cluster.contains_worker(Rank::new(3)));
    }
}
