//! Hierarchical key layout.
//!
//! All keys live under a configured root:
//!
//! ```text
//! /<root>/cluster/<id>
//! /<root>/cluster/<id>/schema/<id>
//! /<root>/cluster/<id>/schema/<id>/table/<name>
//! /<root>/cluster/<id>/shard_view/<id>
//! /<root>/cluster/<id>/cluster_view
//! /<root>/cluster/<id>/node/<name>
//! /<root>/alloc_id/<scope>
//! /<root>/procedure/<kind>/<id>
//! ```
//!
//! Numeric components are zero-padded so lexicographic scan order matches
//! numeric order.

use tessera_common::{ClusterId, ProcedureId, SchemaId, ShardId};

pub fn cluster_key(root: &str, id: ClusterId) -> String {
    format!("{root}/cluster/{:010}", id.0)
}

pub fn cluster_prefix(root: &str) -> String {
    format!("{root}/cluster/")
}

pub fn schema_key(root: &str, cluster: ClusterId, schema: SchemaId) -> String {
    format!("{}/schema/{:010}", cluster_key(root, cluster), schema.0)
}

pub fn schema_prefix(root: &str, cluster: ClusterId) -> String {
    format!("{}/schema/", cluster_key(root, cluster))
}

pub fn table_key(root: &str, cluster: ClusterId, schema: SchemaId, table_name: &str) -> String {
    format!("{}/table/{table_name}", schema_key(root, cluster, schema))
}

pub fn table_prefix(root: &str, cluster: ClusterId, schema: SchemaId) -> String {
    format!("{}/table/", schema_key(root, cluster, schema))
}

pub fn shard_view_key(root: &str, cluster: ClusterId, shard: ShardId) -> String {
    format!("{}/shard_view/{:010}", cluster_key(root, cluster), shard.0)
}

pub fn shard_view_prefix(root: &str, cluster: ClusterId) -> String {
    format!("{}/shard_view/", cluster_key(root, cluster))
}

pub fn cluster_view_key(root: &str, cluster: ClusterId) -> String {
    format!("{}/cluster_view", cluster_key(root, cluster))
}

pub fn node_key(root: &str, cluster: ClusterId, node_name: &str) -> String {
    format!("{}/node/{node_name}", cluster_key(root, cluster))
}

pub fn node_prefix(root: &str, cluster: ClusterId) -> String {
    format!("{}/node/", cluster_key(root, cluster))
}

pub fn alloc_id_key(root: &str, scope: &str) -> String {
    format!("{root}/alloc_id/{scope}")
}

pub fn procedure_key(root: &str, kind: &str, id: ProcedureId) -> String {
    format!("{root}/procedure/{kind}/{:020}", id.0)
}

pub fn procedure_prefix(root: &str) -> String {
    format!("{root}/procedure/")
}

pub fn leader_key(root: &str) -> String {
    format!("{root}/leader")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/tessera";

    #[test]
    fn test_key_shapes() {
        assert_eq!(cluster_key(ROOT, ClusterId(1)), "/tessera/cluster/0000000001");
        assert_eq!(
            table_key(ROOT, ClusterId(1), SchemaId(2), "cpu"),
            "/tessera/cluster/0000000001/schema/0000000002/table/cpu"
        );
        assert_eq!(
            cluster_view_key(ROOT, ClusterId(1)),
            "/tessera/cluster/0000000001/cluster_view"
        );
        assert_eq!(leader_key(ROOT), "/tessera/leader");
    }

    #[test]
    fn test_padding_preserves_scan_order() {
        let a = shard_view_key(ROOT, ClusterId(1), ShardId(2));
        let b = shard_view_key(ROOT, ClusterId(1), ShardId(10));
        assert!(a < b);

        let p = procedure_key(ROOT, "create_table", ProcedureId(9));
        let q = procedure_key(ROOT, "create_table", ProcedureId(11));
        assert!(p < q);
    }

    #[test]
    fn test_prefixes_cover_their_keys() {
        let key = node_key(ROOT, ClusterId(3), "node-0");
        assert!(key.starts_with(&node_prefix(ROOT, ClusterId(3))));
        let key = schema_key(ROOT, ClusterId(3), SchemaId(7));
        assert!(key.starts_with(&schema_prefix(ROOT, ClusterId(3))));
    }
}
