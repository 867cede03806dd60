//! Read and write policies.

/// Where a read is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadPolicy {
    /// Read from the local cache only.
    LocalOnly,
    /// Read from the network only.
    NetworkOnly,
    /// Return the cached value first, then refresh from the network.
    LocalThenNetwork,
    /// Try the network first and fall back to the cache on failure.
    NetworkOtherwiseLocal,
}

impl ReadPolicy {
    /// Number of results a read under this policy delivers.
    pub fn result_count(self) -> usize {
        match self {
            ReadPolicy::LocalThenNetwork => 2,
            _ => 1,
        }
    }

    /// Returns true if the policy reads from the cache at any point.
    pub fn reads_local(self) -> bool {
        !matches!(self, ReadPolicy::NetworkOnly)
    }

    /// Returns true if the policy reads from the network at any point.
    pub fn reads_network(self) -> bool {
        !matches!(self, ReadPolicy::LocalOnly)
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        ReadPolicy::LocalThenNetwork
    }
}

/// Where a write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePolicy {
    /// Write to the cache and queue the network write for a later push.
    LocalOnly,
    /// Write to the network only.
    NetworkOnly,
    /// Write to the cache, return immediately, then write to the network.
    LocalThenNetwork,
}

impl WritePolicy {
    /// Number of results a write under this policy delivers.
    pub fn result_count(self) -> usize {
        match self {
            WritePolicy::LocalThenNetwork => 2,
            _ => 1,
        }
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        WritePolicy::LocalThenNetwork
    }
}
