// Configuration of the in-process simulated cluster.

#[derive(Debug, Clone, PartialEq)]
pub struct SimClusterConfig {
    pub node_count: usize,

    // Latency emulation, applied to every statement round trip
    pub op_min_delay_ms: u64,
    pub op_max_delay_ms: u64,

    // Extra delay for establishing a session
    pub connect_delay_ms: u64,

    // Delay between prepare and commit of a distributed transaction
    pub commit_delay_ms: u64,

    // Apply each write of a commit separately, exposing partial commits to
    // readers. Off for a correct cluster.
    pub torn_commits: bool,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        SimClusterConfig {
            node_count: 3,
            op_min_delay_ms: 1,
            op_max_delay_ms: 3,
            connect_delay_ms: 2,
            commit_delay_ms: 2,
            torn_commits: false,
        }
    }
}

impl SimClusterConfig {
    pub fn with_nodes(node_count: usize) -> Self {
        SimClusterConfig { node_count, ..Default::default() }
    }

    /// Majority needed to commit: more than half of all nodes.
    pub fn quorum(&self) -> usize {
        self.node_count / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(SimClusterConfig::with_nodes(1).quorum(), 1);
        assert_eq!(SimClusterConfig::with_nodes(3).quorum(), 2);
        assert_eq!(SimClusterConfig::with_nodes(4).quorum(), 3);
        assert_eq!(SimClusterConfig::with_nodes(5).quorum(), 3);
    }
}
