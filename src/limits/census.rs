//! The live connection census consulted by the engine.

/// One busy worker slot: who it is serving, and for which virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CensusEntry {
    pub client_address: String,
    pub virtual_host: String,
}

impl CensusEntry {
    pub fn new(client_address: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            client_address: client_address.into(),
            virtual_host: virtual_host.into(),
        }
    }
}

/// Provider of a point-in-time view of in-flight connections.
///
/// Implementations hand out an owned snapshot so that no lock is held while
/// the engine scans it. Idle slots are left out.
pub trait Census: Send + Sync {
    fn snapshot(&self) -> Vec<CensusEntry>;
}

impl Census for Vec<CensusEntry> {
    fn snapshot(&self) -> Vec<CensusEntry> {
        self.clone()
    }
}
