//! CozoDB-backed heuristic store
//!
//! Wraps CozoDB with a RocksDB backend (or the in-memory engine for tests).
//! Handles database creation, schema migrations and HNSW similarity search
//! over condition and action embeddings.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cozo::{DataValue, DbInstance, NamedRows, Vector};
use ndarray::Array1;
use tracing::debug;

use super::schema::{MIGRATIONS, Migration};
use super::traits::HeuristicBackend;
use crate::confidence::{Evidence, FeedbackSource};
use crate::embedding::{EMBEDDING_DIM, cosine_similarity};
use crate::error::{ReflexError, Result};
use crate::types::{
    Domain, FireId, FireOutcome, FireRecord, Heuristic, HeuristicId, Origin, SituationId,
};

const HEURISTIC_COLUMNS: &str = "id, condition, action, domain, alpha, beta, fire_count, \
success_count, active, origin, version, created_at, updated_at";

const FIRE_COLUMNS: &str =
    "id, heuristic_id, situation_id, fired_at, outcome, feedback_source, resolved_at";

/// Which embedding relation a search runs against
#[derive(Debug, Clone, Copy)]
enum EmbeddingKind {
    Condition,
    Action,
}

impl EmbeddingKind {
    fn relation(self) -> &'static str {
        match self {
            Self::Condition => "condition_embedding",
            Self::Action => "action_embedding",
        }
    }
}

/// CozoDB-backed [`HeuristicBackend`]
pub struct CozoBackend {
    db: Arc<DbInstance>,
}

impl CozoBackend {
    /// Open or create a heuristic database at the given path
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ReflexError::Database(format!("Failed to create directory: {e}")))?;
        }

        let db = DbInstance::new("rocksdb", path, "")
            .map_err(|e| ReflexError::Database(format!("Failed to open database: {e}")))?;
        Self::init(db).await
    }

    /// Create a non-persistent database using Cozo's in-memory engine
    pub async fn open_in_memory() -> Result<Self> {
        let db = DbInstance::new("mem", "", "")
            .map_err(|e| ReflexError::Database(format!("Failed to open database: {e}")))?;
        Self::init(db).await
    }

    async fn init(db: DbInstance) -> Result<Self> {
        let store = Self { db: Arc::new(db) };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Get current schema version from database
    pub async fn get_schema_version(&self) -> Result<u32> {
        let query = "?[version] := *schema_version{version}, version = max(version)";

        match self.run_query(query, BTreeMap::new()).await {
            Ok(rows) if !rows.rows.is_empty() => {
                let version = rows.rows[0][0]
                    .get_int()
                    .ok_or_else(|| ReflexError::Database("Invalid version type".into()))?;
                Ok(version as u32)
            }
            Ok(_) => Ok(0),
            Err(e) => {
                // relation does not exist before the first migration
                let msg = e.to_string();
                if msg.contains("not found") || msg.contains("Cannot find") {
                    Ok(0)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        let current = self.get_schema_version().await?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            self.apply_migration(migration).await?;
        }

        Ok(())
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<()> {
        self.db
            .run_script(
                migration.script,
                BTreeMap::new(),
                cozo::ScriptMutability::Mutable,
            )
            .map_err(|e| {
                ReflexError::Migration(format!("Migration {} failed: {e}", migration.version))
            })?;

        let mut params = BTreeMap::new();
        params.insert("version".to_string(), DataValue::from(i64::from(migration.version)));
        params.insert("applied_at".to_string(), DataValue::from(Utc::now().timestamp()));
        params.insert("description".to_string(), DataValue::Str(migration.description.into()));

        self.db
            .run_script(
                "?[version, applied_at, description] <- [[$version, $applied_at, $description]] \
                 :put schema_version {version => applied_at, description}",
                params,
                cozo::ScriptMutability::Mutable,
            )
            .map_err(|e| {
                ReflexError::Migration(format!(
                    "Failed to record migration {}: {e}",
                    migration.version
                ))
            })?;

        debug!(version = migration.version, "applied schema migration");
        Ok(())
    }

    async fn run_query(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<NamedRows> {
        self.db
            .run_script(query, params, cozo::ScriptMutability::Immutable)
            .map_err(|e| ReflexError::Database(format!("Query failed: {e}")))
    }

    async fn run_mutation(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<NamedRows> {
        self.db
            .run_script(query, params, cozo::ScriptMutability::Mutable)
            .map_err(|e| ReflexError::Database(format!("Mutation failed: {e}")))
    }

    /// Fetch several heuristics with their embeddings
    async fn get_many(&self, ids: &[HeuristicId]) -> Result<Vec<Heuristic>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = ids
            .iter()
            .map(|id| format!("'{id}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "?[{HEURISTIC_COLUMNS}] := *heuristic{{{HEURISTIC_COLUMNS}}}, id in [{id_list}]"
        );
        let rows = self.run_query(&query, BTreeMap::new()).await?;

        let mut conditions = self.embeddings_for(EmbeddingKind::Condition, &id_list).await?;
        let mut actions = self.embeddings_for(EmbeddingKind::Action, &id_list).await?;

        let mut heuristics = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let mut heuristic = row_to_heuristic(row)?;
            heuristic.condition_embedding = conditions.remove(&heuristic.id).ok_or_else(|| {
                ReflexError::Database(format!("Missing condition embedding for {}", heuristic.id))
            })?;
            heuristic.action_embedding = actions.remove(&heuristic.id);
            heuristics.push(heuristic);
        }

        Ok(heuristics)
    }

    async fn embeddings_for(
        &self,
        kind: EmbeddingKind,
        id_list: &str,
    ) -> Result<HashMap<HeuristicId, Vec<f32>>> {
        let query = format!(
            "?[id, embedding] := *{}{{id, embedding}}, id in [{id_list}]",
            kind.relation()
        );
        let rows = self.run_query(&query, BTreeMap::new()).await?;

        let mut embeddings = HashMap::with_capacity(rows.rows.len());
        for row in &rows.rows {
            embeddings.insert(parse_id(&row[0])?, vector_from(&row[1])?);
        }
        Ok(embeddings)
    }

    /// HNSW search within a domain, returning cosine similarity
    async fn search(
        &self,
        kind: EmbeddingKind,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(ReflexError::InvalidArgument(format!(
                "Invalid embedding dimension: expected {EMBEDDING_DIM}, got {}",
                embedding.len()
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut params = BTreeMap::new();
        params.insert("query_vec".to_string(), vector_param(embedding));
        params.insert("k".to_string(), DataValue::from(limit as i64));
        params.insert("domain".to_string(), DataValue::Str(domain.as_str().into()));

        // ef: 50 keeps recall high for the small k used here
        let query = format!(
            r#"?[id, domain, active, embedding] := ~{}:semantic_idx {{
                id, domain, active, embedding |
                query: $query_vec,
                k: $k,
                ef: 50,
                filter: domain == $domain && active
            }}"#,
            kind.relation()
        );

        let rows = self.run_query(&query, params).await?;

        let mut scored: Vec<(HeuristicId, f64)> = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let same_domain = row[1].get_str() == Some(domain.as_str());
            let active = matches!(row[2], DataValue::Bool(true));
            if !(same_domain && active) {
                continue;
            }
            let stored = vector_from(&row[3])?;
            scored.push((parse_id(&row[0])?, cosine_similarity(embedding, &stored)));
        }

        let ids: Vec<HeuristicId> = scored.iter().map(|(id, _)| *id).collect();
        let mut by_id: HashMap<HeuristicId, Heuristic> = self
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|h| (h.id, h))
            .collect();

        let mut results: Vec<(Heuristic, f64)> = scored
            .into_iter()
            .filter_map(|(id, sim)| by_id.remove(&id).map(|h| (h, sim)))
            .filter(|(h, _)| h.active && &h.domain == domain)
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }
}

#[async_trait]
impl HeuristicBackend for CozoBackend {
    async fn put_heuristic(&self, heuristic: &Heuristic) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::Str(heuristic.id.to_string().into()));
        params.insert("condition".to_string(), DataValue::Str(heuristic.condition.as_str().into()));
        params.insert("action".to_string(), DataValue::Str(heuristic.action.as_str().into()));
        params.insert("domain".to_string(), DataValue::Str(heuristic.domain.as_str().into()));
        params.insert("alpha".to_string(), DataValue::from(heuristic.evidence.alpha));
        params.insert("beta".to_string(), DataValue::from(heuristic.evidence.beta));
        params.insert("fire_count".to_string(), DataValue::from(heuristic.fire_count as i64));
        params.insert(
            "success_count".to_string(),
            DataValue::from(heuristic.success_count as i64),
        );
        params.insert("active".to_string(), DataValue::Bool(heuristic.active));
        params.insert("origin".to_string(), DataValue::Str(heuristic.origin.as_str().into()));
        params.insert("version".to_string(), DataValue::from(heuristic.version as i64));
        params.insert(
            "created_at".to_string(),
            DataValue::from(heuristic.created_at.timestamp_millis()),
        );
        params.insert(
            "updated_at".to_string(),
            DataValue::from(heuristic.updated_at.timestamp_millis()),
        );
        params.insert(
            "condition_embedding".to_string(),
            vector_param(&heuristic.condition_embedding),
        );

        let action_block = match &heuristic.action_embedding {
            Some(embedding) => {
                params.insert("action_embedding".to_string(), vector_param(embedding));
                r#"{
                    ?[id, domain, active, embedding] <- [[$id, $domain, $active, $action_embedding]]
                    :put action_embedding { id => domain, active, embedding }
                }"#
            }
            None => {
                r#"{
                    ?[id] <- [[$id]]
                    :rm action_embedding { id }
                }"#
            }
        };

        // chained blocks run as one transaction
        let script = format!(
            r#"{{
                ?[{HEURISTIC_COLUMNS}] <- [[$id, $condition, $action, $domain, $alpha, $beta,
                    $fire_count, $success_count, $active, $origin, $version, $created_at, $updated_at]]
                :put heuristic {{
                    id => condition, action, domain, alpha, beta, fire_count, success_count,
                    active, origin, version, created_at, updated_at
                }}
            }}
            {{
                ?[id, domain, active, embedding] <- [[$id, $domain, $active, $condition_embedding]]
                :put condition_embedding {{ id => domain, active, embedding }}
            }}
            {action_block}"#
        );

        self.run_mutation(&script, params).await?;
        Ok(())
    }

    async fn get_heuristic(&self, id: HeuristicId) -> Result<Option<Heuristic>> {
        Ok(self.get_many(&[id]).await?.into_iter().next())
    }

    async fn delete_heuristic(&self, id: HeuristicId) -> Result<bool> {
        if self.get_heuristic(id).await?.is_none() {
            return Ok(false);
        }

        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::Str(id.to_string().into()));

        let script = r#"
            { ?[id] <- [[$id]] :rm heuristic { id } }
            { ?[id] <- [[$id]] :rm condition_embedding { id } }
            { ?[id] <- [[$id]] :rm action_embedding { id } }
        "#;
        self.run_mutation(script, params).await?;
        Ok(true)
    }

    async fn search_conditions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        self.search(EmbeddingKind::Condition, embedding, domain, limit)
            .await
    }

    async fn search_actions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        self.search(EmbeddingKind::Action, embedding, domain, limit)
            .await
    }

    async fn list_domain(&self, domain: &Domain) -> Result<Vec<Heuristic>> {
        let mut params = BTreeMap::new();
        params.insert("domain".to_string(), DataValue::Str(domain.as_str().into()));

        let query = "?[id] := *heuristic{id, domain, active}, domain = $domain, active = true";
        let rows = self.run_query(query, params).await?;

        let ids = rows
            .rows
            .iter()
            .map(|row| parse_id(&row[0]))
            .collect::<Result<Vec<_>>>()?;
        self.get_many(&ids).await
    }

    async fn put_fire(&self, fire: &FireRecord) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::Str(fire.id.to_string().into()));
        params.insert(
            "heuristic_id".to_string(),
            DataValue::Str(fire.heuristic_id.to_string().into()),
        );
        params.insert(
            "situation_id".to_string(),
            DataValue::Str(fire.situation_id.as_str().into()),
        );
        params.insert("fired_at".to_string(), DataValue::from(fire.fired_at.timestamp_millis()));
        params.insert("outcome".to_string(), DataValue::Str(fire.outcome.as_str().into()));
        params.insert(
            "feedback_source".to_string(),
            fire.feedback_source
                .map(|s| DataValue::Str(s.as_str().into()))
                .unwrap_or(DataValue::Null),
        );
        params.insert(
            "resolved_at".to_string(),
            fire.resolved_at
                .map(|t| DataValue::from(t.timestamp_millis()))
                .unwrap_or(DataValue::Null),
        );

        let query = format!(
            "?[{FIRE_COLUMNS}] <- [[$id, $heuristic_id, $situation_id, $fired_at, $outcome, \
             $feedback_source, $resolved_at]] \
             :put fire_record {{id => heuristic_id, situation_id, fired_at, outcome, \
             feedback_source, resolved_at}}"
        );
        self.run_mutation(&query, params).await?;
        Ok(())
    }

    async fn get_fire(&self, id: FireId) -> Result<Option<FireRecord>> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::Str(id.to_string().into()));

        let query = format!("?[{FIRE_COLUMNS}] := *fire_record{{{FIRE_COLUMNS}}}, id = $id");
        let rows = self.run_query(&query, params).await?;

        rows.rows.first().map(|row| row_to_fire(row)).transpose()
    }

    async fn fires_for(&self, heuristic_id: HeuristicId, limit: usize) -> Result<Vec<FireRecord>> {
        let mut params = BTreeMap::new();
        params.insert(
            "heuristic_id".to_string(),
            DataValue::Str(heuristic_id.to_string().into()),
        );

        let query = format!(
            "?[{FIRE_COLUMNS}] := *fire_record{{{FIRE_COLUMNS}}}, heuristic_id = $heuristic_id \
             :order -fired_at, -id :limit {limit}"
        );
        let rows = self.run_query(&query, params).await?;

        rows.rows.iter().map(|row| row_to_fire(row)).collect()
    }

    async fn count(&self) -> Result<u64> {
        let rows = self
            .run_query("?[count(id)] := *heuristic{id}", BTreeMap::new())
            .await?;

        if rows.rows.is_empty() {
            return Ok(0);
        }

        let count = rows.rows[0][0]
            .get_int()
            .ok_or_else(|| ReflexError::Database("Invalid count type".into()))?;
        Ok(count as u64)
    }
}

fn vector_param(embedding: &[f32]) -> DataValue {
    let array: Array1<f32> = Array1::from_vec(embedding.to_vec());
    DataValue::Vec(Vector::F32(array))
}

fn vector_from(value: &DataValue) -> Result<Vec<f32>> {
    match value {
        DataValue::Vec(Vector::F32(array)) => Ok(array.to_vec()),
        DataValue::Vec(Vector::F64(array)) => Ok(array.iter().map(|x| *x as f32).collect()),
        _ => Err(ReflexError::Database("Invalid embedding type".into())),
    }
}

fn parse_id(value: &DataValue) -> Result<HeuristicId> {
    let s = value
        .get_str()
        .ok_or_else(|| ReflexError::Database("Invalid id type".into()))?;
    HeuristicId::parse_str(s).map_err(|e| ReflexError::Database(format!("Invalid UUID: {e}")))
}

fn get_str<'a>(value: &'a DataValue, field: &str) -> Result<&'a str> {
    value
        .get_str()
        .ok_or_else(|| ReflexError::Database(format!("Invalid {field} type")))
}

fn get_float(value: &DataValue, field: &str) -> Result<f64> {
    value
        .get_float()
        .ok_or_else(|| ReflexError::Database(format!("Invalid {field} type")))
}

fn get_int(value: &DataValue, field: &str) -> Result<i64> {
    value
        .get_int()
        .ok_or_else(|| ReflexError::Database(format!("Invalid {field} type")))
}

fn get_timestamp(value: &DataValue, field: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(get_int(value, field)?)
        .ok_or_else(|| ReflexError::Database(format!("Invalid {field} timestamp")))
}

/// Build a heuristic from a row of `HEURISTIC_COLUMNS`; embeddings are
/// attached by the caller
fn row_to_heuristic(row: &[DataValue]) -> Result<Heuristic> {
    if row.len() < 13 {
        return Err(ReflexError::Database(format!(
            "Heuristic row has {} columns, expected 13",
            row.len()
        )));
    }

    let active = match row[8] {
        DataValue::Bool(b) => b,
        _ => return Err(ReflexError::Database("Invalid active type".into())),
    };
    let origin = Origin::from_str(get_str(&row[9], "origin")?)
        .map_err(|e| ReflexError::Database(format!("Invalid origin: {e}")))?;

    Ok(Heuristic {
        id: parse_id(&row[0])?,
        condition: get_str(&row[1], "condition")?.to_string(),
        condition_embedding: Vec::new(),
        action: get_str(&row[2], "action")?.to_string(),
        action_embedding: None,
        domain: Domain::new(get_str(&row[3], "domain")?),
        evidence: Evidence {
            alpha: get_float(&row[4], "alpha")?,
            beta: get_float(&row[5], "beta")?,
        },
        fire_count: get_int(&row[6], "fire_count")? as u64,
        success_count: get_int(&row[7], "success_count")? as u64,
        active,
        origin,
        version: get_int(&row[10], "version")? as u64,
        created_at: get_timestamp(&row[11], "created_at")?,
        updated_at: get_timestamp(&row[12], "updated_at")?,
    })
}

fn row_to_fire(row: &[DataValue]) -> Result<FireRecord> {
    if row.len() < 7 {
        return Err(ReflexError::Database(format!(
            "Fire row has {} columns, expected 7",
            row.len()
        )));
    }

    let outcome = FireOutcome::from_str(get_str(&row[4], "outcome")?)
        .map_err(|e| ReflexError::Database(format!("Invalid outcome: {e}")))?;
    let feedback_source = match &row[5] {
        DataValue::Null => None,
        value => Some(
            FeedbackSource::from_str(get_str(value, "feedback_source")?)
                .map_err(|e| ReflexError::Database(format!("Invalid feedback source: {e}")))?,
        ),
    };
    let resolved_at = match &row[6] {
        DataValue::Null => None,
        value => Some(get_timestamp(value, "resolved_at")?),
    };

    Ok(FireRecord {
        id: parse_id(&row[0])?,
        heuristic_id: parse_id(&row[1])?,
        situation_id: SituationId::from(get_str(&row[2], "situation_id")?),
        fired_at: get_timestamp(&row[3], "fired_at")?,
        outcome,
        feedback_source,
        resolved_at,
    })
}
