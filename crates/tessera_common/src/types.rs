use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a cluster within one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

/// Unique identifier of a schema within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub u32);

/// Unique identifier of a shard within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

/// Unique identifier of a table within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Identifier of a durable procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcedureId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster:{}", self.0)
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema:{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc:{}", self.0)
    }
}

/// Placement state of a cluster.
///
/// `Empty` until the first shard assignment, `Prepare` while a topology
/// change is in flight, `Stable` once every shard has an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Empty,
    Prepare,
    Stable,
}

/// Role a node plays for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Leader,
    Follower,
}

/// Status a data node reports for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Unknown,
    Ready,
    PartialOpen,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Unknown => write!(f, "unknown"),
            ShardStatus::Ready => write!(f, "ready"),
            ShardStatus::PartialOpen => write!(f, "partialOpen"),
        }
    }
}

/// Liveness state of a registered node. Rows are never deleted; an expired
/// node transitions to `Offline` and stays in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unknown,
    Online,
    Offline,
}

/// How shard placement is managed.
///
/// `Static`: shards are placed at cluster init and never moved implicitly.
/// `Dynamic`: the scheduler may reassign shards away from expired nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyType {
    Static,
    Dynamic,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyType::Static => write!(f, "static"),
            TopologyType::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl std::str::FromStr for TopologyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(TopologyType::Static),
            "dynamic" => Ok(TopologyType::Dynamic),
            other => Err(format!("unknown topology type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ShardId(3).to_string(), "shard:3");
        assert_eq!(TableId(42).to_string(), "tbl:42");
        assert_eq!(ProcedureId(7).to_string(), "proc:7");
    }

    #[test]
    fn test_topology_type_round_trip() {
        for t in [TopologyType::Static, TopologyType::Dynamic] {
            let parsed: TopologyType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert!("ring".parse::<TopologyType>().is_err());
    }

    #[test]
    fn test_ids_are_ordered() {
        assert!(ShardId(1) < ShardId(2));
        assert!(TableId(9) < TableId(10));
    }
}
