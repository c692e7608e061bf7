//! CozoDB schema definitions for the heuristic store
//!
//! Heuristic rows, their condition/action embeddings (each with an HNSW
//! cosine index), and the fire-record log.

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Initial schema creation script (Datalog)
///
/// Embedding relations carry `domain` and `active` next to the vector so the
/// HNSW search can filter inside the index instead of after it.
pub const INITIAL_SCHEMA: &str = r#"
{
    :create schema_version {
        version: Int =>
        applied_at: Int,
        description: String
    }
}
{
    :create heuristic {
        id: String =>
        condition: String,
        action: String,
        domain: String,
        alpha: Float,
        beta: Float,
        fire_count: Int,
        success_count: Int,
        active: Bool,
        origin: String,
        version: Int,
        created_at: Int,
        updated_at: Int
    }
}
{
    :create condition_embedding {
        id: String =>
        domain: String,
        active: Bool,
        embedding: <F32; 384>
    }
}
{
    :create action_embedding {
        id: String =>
        domain: String,
        active: Bool,
        embedding: <F32; 384>
    }
}
{
    ::index create heuristic:by_domain { domain }
}
{
    ::hnsw create condition_embedding:semantic_idx {
        dim: 384,
        m: 16,
        ef_construction: 200,
        fields: [embedding],
        distance: Cosine
    }
}
{
    ::hnsw create action_embedding:semantic_idx {
        dim: 384,
        m: 16,
        ef_construction: 200,
        fields: [embedding],
        distance: Cosine
    }
}
"#;

/// Fire-record log (Migration v2)
pub const FIRE_LOG_SCHEMA: &str = r#"
{
    :create fire_record {
        id: String =>
        heuristic_id: String,
        situation_id: String,
        fired_at: Int,
        outcome: String,
        feedback_source: String?,
        resolved_at: Int?
    }
}
{
    ::index create fire_record:by_heuristic { heuristic_id }
}
"#;

/// Schema migration definition
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number for this migration
    pub version: u32,
    /// Human-readable description of what this migration does
    pub description: &'static str,
    /// The Datalog script to execute for this migration
    pub script: &'static str,
}

/// All migrations in order
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Heuristics and embedding indexes",
        script: INITIAL_SCHEMA,
    },
    Migration {
        version: 2,
        description: "Fire record log",
        script: FIRE_LOG_SCHEMA,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_current() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_initial_schema_contains_tables() {
        assert!(INITIAL_SCHEMA.contains(":create schema_version {"));
        assert!(INITIAL_SCHEMA.contains(":create heuristic {"));
        assert!(INITIAL_SCHEMA.contains(":create condition_embedding {"));
        assert!(INITIAL_SCHEMA.contains(":create action_embedding {"));
    }

    #[test]
    fn test_embedding_indexes_use_cosine() {
        assert!(INITIAL_SCHEMA.contains("::hnsw create condition_embedding:semantic_idx"));
        assert!(INITIAL_SCHEMA.contains("::hnsw create action_embedding:semantic_idx"));
        assert_eq!(INITIAL_SCHEMA.matches("distance: Cosine").count(), 2);
    }

    #[test]
    fn test_fire_log_indexed_by_heuristic() {
        assert!(FIRE_LOG_SCHEMA.contains(":create fire_record {"));
        assert!(FIRE_LOG_SCHEMA.contains("::index create fire_record:by_heuristic"));
    }
}
