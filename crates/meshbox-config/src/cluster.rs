//! The cluster file: a JSON document naming the controller and every worker machine.

use serde::{Deserialize, Serialize};

/// The controller's own RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerEndpoint {
    /// Address to listen on / connect to.
    pub addr: String,
    /// Port to listen on / connect to.
    pub port: u16,
}

/// One worker machine's RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcNode {
    /// Dense machine id.
    pub machine_id: u32,
    /// Address of the worker's RPC server.
    pub addr: String,
    /// Port of the worker's RPC server.
    pub port: u16,
}

/// One machine's memory-transfer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Dense machine id (matches a [`GrpcNode::machine_id`]).
    pub machine_id: u32,
    /// Address of the worker's memory-transfer endpoint.
    pub addr: String,
    /// Port of the worker's memory-transfer endpoint.
    pub port: u16,
}

/// The full cluster topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The controller's endpoint.
    pub controller: ControllerEndpoint,
    /// Every worker's RPC endpoint.
    pub grpc_nodes: Vec<GrpcNode>,
    /// Every worker's memory-transfer endpoint.
    pub memory_nodes: Vec<MemoryNode>,
}

impl ClusterConfig {
    /// Parses a cluster file from its JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterConfig;

    // ── 1. parses a minimal cluster file ──
    #[test]
    fn parses_minimal_cluster_file() {
        let text = r#"{
            "controller": {"addr": "127.0.0.1", "port": 9000},
            "grpc_nodes": [{"machine_id": 0, "addr": "127.0.0.1", "port": 9100}],
            "memory_nodes": [{"machine_id": 0, "addr": "127.0.0.1", "port": 9200}]
        }"#;
        let config = ClusterConfig::parse(text).expect("parse");
        assert_eq!(config.controller.port, 9000);
        assert_eq!(config.grpc_nodes.len(), 1);
        assert_eq!(config.grpc_nodes[0].machine_id, 0);
    }

    // ── 2. rejects malformed JSON ──
    #[test]
    fn rejects_malformed_json() {
        assert!(ClusterConfig::parse("not json").is_err());
    }
}
