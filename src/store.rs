use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::model::{ProcessNode, UsecaseCandidate};
use crate::util::now_utc_string;

/// Generation settings read from the `admin_settings` table at startup.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub owner: String,
}

pub fn open(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;

    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;

    Ok(connection)
}

/// Additive schema bootstrap. The taxonomy and settings tables are owned
/// by the CRUD application; creating them here lets the pipeline attach
/// to its database or run against an empty one in tests.
pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS process_nodes (
              id INTEGER PRIMARY KEY,
              model_key TEXT NOT NULL,
              pcf_id TEXT,
              code TEXT NOT NULL,
              name TEXT NOT NULL,
              description TEXT,
              parent_id INTEGER REFERENCES process_nodes(id),
              level INTEGER NOT NULL,
              UNIQUE(model_key, code)
            );
            CREATE INDEX IF NOT EXISTS idx_process_nodes_parent
              ON process_nodes(parent_id);
            CREATE INDEX IF NOT EXISTS idx_process_nodes_model
              ON process_nodes(model_key);

            CREATE TABLE IF NOT EXISTS node_documents (
              id INTEGER PRIMARY KEY,
              node_id INTEGER NOT NULL REFERENCES process_nodes(id),
              document_type TEXT NOT NULL,
              title TEXT,
              content TEXT NOT NULL,
              owner TEXT NOT NULL,
              meta_json TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE(node_id, document_type)
            );
            CREATE INDEX IF NOT EXISTS idx_node_documents_type
              ON node_documents(document_type);

            CREATE TABLE IF NOT EXISTS usecase_candidates (
              id INTEGER PRIMARY KEY,
              node_id INTEGER NOT NULL REFERENCES process_nodes(id),
              candidate_uid TEXT NOT NULL UNIQUE,
              title TEXT NOT NULL,
              description TEXT NOT NULL,
              impact_assessment TEXT,
              complexity_score INTEGER,
              owner TEXT NOT NULL,
              meta_json TEXT,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usecase_candidates_node
              ON usecase_candidates(node_id);

            CREATE TABLE IF NOT EXISTS admin_settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            ",
        )
        .context("failed to ensure schema")?;

    Ok(())
}

pub fn get_setting(connection: &Connection, key: &str) -> Result<Option<String>> {
    let value = connection
        .query_row(
            "SELECT value FROM admin_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read setting: {key}"))?;

    Ok(value)
}

fn setting_or(connection: &Connection, key: &str, default: &str) -> Result<String> {
    Ok(get_setting(connection, key)?
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string()))
}

pub fn load_generation_settings(connection: &Connection) -> Result<GenerationSettings> {
    let Some(api_key) =
        get_setting(connection, "openai_api_key")?.filter(|value| !value.trim().is_empty())
    else {
        bail!("openai_api_key not found in admin settings");
    };

    let base_url = setting_or(connection, "openai_base_url", "https://api.openai.com")?;
    let model = setting_or(connection, "openai_model", "gpt-5")?;
    let temperature = setting_or(connection, "openai_temperature", "1.0")?
        .parse::<f64>()
        .context("openai_temperature setting is not a number")?;
    let owner = setting_or(connection, "service_account", "batch-service")?;

    Ok(GenerationSettings {
        api_key,
        base_url,
        model,
        temperature,
        owner,
    })
}

const NODE_COLUMNS: &str = "
    n.id, n.model_key, n.pcf_id, n.code, n.name, n.description, n.parent_id, n.level,
    NOT EXISTS(SELECT 1 FROM process_nodes c WHERE c.parent_id = n.id)
";

fn map_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessNode> {
    Ok(ProcessNode {
        id: row.get(0)?,
        model_key: row.get(1)?,
        pcf_id: row.get(2)?,
        code: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        parent_id: row.get(6)?,
        level: row.get(7)?,
        is_leaf: row.get(8)?,
    })
}

pub fn get_node(connection: &Connection, node_id: i64) -> Result<Option<ProcessNode>> {
    let node = connection
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM process_nodes n WHERE n.id = ?1"),
            params![node_id],
            map_node,
        )
        .optional()
        .with_context(|| format!("failed to load node {node_id}"))?;

    Ok(node)
}

pub fn leaf_nodes(connection: &Connection, model_key: &str) -> Result<Vec<ProcessNode>> {
    let mut statement = connection.prepare(&format!(
        "
        SELECT {NODE_COLUMNS}
        FROM process_nodes n
        WHERE n.model_key = ?1
          AND NOT EXISTS(SELECT 1 FROM process_nodes c WHERE c.parent_id = n.id)
        ORDER BY n.code ASC
        "
    ))?;

    let nodes = statement
        .query_map(params![model_key], map_node)?
        .collect::<rusqlite::Result<Vec<ProcessNode>>>()
        .with_context(|| format!("failed to load leaf nodes for {model_key}"))?;

    Ok(nodes)
}

/// Ancestors of `node` ordered root-first. Guards against parent cycles,
/// which would otherwise loop forever on corrupted hierarchies.
pub fn get_ancestors(connection: &Connection, node: &ProcessNode) -> Result<Vec<ProcessNode>> {
    let mut ancestors = Vec::new();
    let mut seen = HashSet::from([node.id]);
    let mut current_parent = node.parent_id;

    while let Some(parent_id) = current_parent {
        if !seen.insert(parent_id) {
            bail!("parent cycle detected at node {parent_id}");
        }

        let Some(parent) = get_node(connection, parent_id)? else {
            bail!("node {parent_id} referenced as parent but missing");
        };

        current_parent = parent.parent_id;
        ancestors.push(parent);
    }

    ancestors.reverse();
    Ok(ancestors)
}

pub fn children(connection: &Connection, parent_id: i64) -> Result<Vec<ProcessNode>> {
    let mut statement = connection.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM process_nodes n WHERE n.parent_id = ?1 ORDER BY n.code ASC"
    ))?;

    let nodes = statement
        .query_map(params![parent_id], map_node)?
        .collect::<rusqlite::Result<Vec<ProcessNode>>>()
        .with_context(|| format!("failed to load children of node {parent_id}"))?;

    Ok(nodes)
}

pub fn siblings(connection: &Connection, node: &ProcessNode) -> Result<Vec<ProcessNode>> {
    let Some(parent_id) = node.parent_id else {
        return Ok(Vec::new());
    };

    Ok(children(connection, parent_id)?
        .into_iter()
        .filter(|sibling| sibling.id != node.id)
        .collect())
}

/// Nodes in other model variants that are the same process: matched on
/// the full (pcf_id, name, description) tuple. A pcf_id match with a
/// differing name or description is no match.
pub fn variant_matches(connection: &Connection, node: &ProcessNode) -> Result<Vec<ProcessNode>> {
    let Some(pcf_id) = node.pcf_id.as_deref() else {
        return Ok(Vec::new());
    };

    let mut statement = connection.prepare(&format!(
        "
        SELECT {NODE_COLUMNS}
        FROM process_nodes n
        WHERE n.model_key != ?1
          AND n.pcf_id = ?2
          AND n.name = ?3
          AND COALESCE(n.description, '') = ?4
        ORDER BY n.model_key ASC
        "
    ))?;

    let nodes = statement
        .query_map(
            params![
                node.model_key,
                pcf_id,
                node.name,
                node.description.as_deref().unwrap_or(""),
            ],
            map_node,
        )?
        .collect::<rusqlite::Result<Vec<ProcessNode>>>()
        .with_context(|| format!("failed to load variant matches for node {}", node.id))?;

    Ok(nodes)
}

pub fn process_details_content(connection: &Connection, node_id: i64) -> Result<Option<String>> {
    let content = connection
        .query_row(
            "
            SELECT content FROM node_documents
            WHERE node_id = ?1 AND document_type = 'process_details'
            ",
            params![node_id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to load process details for node {node_id}"))?;

    Ok(content)
}

pub fn node_ids_with_document(
    connection: &Connection,
    model_key: &str,
    document_type: &str,
) -> Result<HashSet<i64>> {
    let mut statement = connection.prepare(
        "
        SELECT DISTINCT d.node_id
        FROM node_documents d
        JOIN process_nodes n ON n.id = d.node_id
        WHERE n.model_key = ?1 AND d.document_type = ?2
        ",
    )?;

    let ids = statement
        .query_map(params![model_key, document_type], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<i64>>>()
        .context("failed to load documented node ids")?;

    Ok(ids)
}

pub fn node_ids_with_generated_usecases(
    connection: &Connection,
    model_key: &str,
) -> Result<HashSet<i64>> {
    let mut statement = connection.prepare(
        "
        SELECT DISTINCT u.node_id
        FROM usecase_candidates u
        JOIN process_nodes n ON n.id = u.node_id
        WHERE n.model_key = ?1
          AND json_extract(u.meta_json, '$.generated_by') = 'batch_api'
        ",
    )?;

    let ids = statement
        .query_map(params![model_key], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<i64>>>()
        .context("failed to load node ids with generated use cases")?;

    Ok(ids)
}

pub fn nodes_missing_document(
    connection: &Connection,
    model_key: &str,
    document_type: &str,
) -> Result<Vec<i64>> {
    let documented = node_ids_with_document(connection, model_key, document_type)?;

    Ok(leaf_nodes(connection, model_key)?
        .into_iter()
        .filter(|node| !documented.contains(&node.id))
        .map(|node| node.id)
        .collect())
}

pub fn upsert_document(
    connection: &Connection,
    node_id: i64,
    document_type: &str,
    title: &str,
    content: &str,
    owner: &str,
    meta_json: &str,
) -> Result<()> {
    connection
        .execute(
            "
            INSERT INTO node_documents(
              node_id, document_type, title, content, owner, meta_json, created_at, updated_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(node_id, document_type) DO UPDATE SET
              title=excluded.title,
              content=excluded.content,
              owner=excluded.owner,
              meta_json=excluded.meta_json,
              updated_at=excluded.updated_at
            ",
            params![
                node_id,
                document_type,
                title,
                content,
                owner,
                meta_json,
                now_utc_string(),
            ],
        )
        .with_context(|| format!("failed to upsert {document_type} document for node {node_id}"))?;

    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceOutcome {
    pub inserted: usize,
    pub already_present: usize,
}

/// Full replace of a node's batch-generated candidates in one
/// transaction: user-authored candidates survive, and a candidate_uid
/// collision (concurrent retry already wrote the row) counts as
/// already present rather than failing the batch.
pub fn replace_usecases(
    connection: &mut Connection,
    node_id: i64,
    candidates: &[UsecaseCandidate],
    owner: &str,
) -> Result<ReplaceOutcome> {
    let tx = connection.transaction()?;
    let mut outcome = ReplaceOutcome::default();

    tx.execute(
        "
        DELETE FROM usecase_candidates
        WHERE node_id = ?1
          AND json_extract(meta_json, '$.generated_by') = 'batch_api'
        ",
        params![node_id],
    )
    .with_context(|| format!("failed to delete prior candidates for node {node_id}"))?;

    for candidate in candidates {
        let meta_json = serde_json::to_string(&candidate.meta)
            .context("failed to serialize use-case metadata")?;

        let inserted = tx.execute(
            "
            INSERT INTO usecase_candidates(
              node_id, candidate_uid, title, description, impact_assessment,
              complexity_score, owner, meta_json, created_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                node_id,
                candidate.candidate_uid,
                candidate.title,
                candidate.description,
                candidate.impact_assessment,
                candidate.complexity_score,
                owner,
                meta_json,
                now_utc_string(),
            ],
        );

        match inserted {
            Ok(_) => outcome.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ffi::ErrorCode::ConstraintViolation =>
            {
                outcome.already_present += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to insert candidate {} for node {node_id}",
                        candidate.candidate_uid
                    )
                });
            }
        }
    }

    tx.commit()
        .with_context(|| format!("failed to commit candidate replace for node {node_id}"))?;

    Ok(outcome)
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn open_in_memory() -> Connection {
        let connection = Connection::open_in_memory().expect("in-memory database");
        ensure_schema(&connection).expect("schema");
        connection
    }

    pub(crate) fn insert_node(
        connection: &Connection,
        id: i64,
        model_key: &str,
        pcf_id: Option<&str>,
        code: &str,
        name: &str,
        description: Option<&str>,
        parent_id: Option<i64>,
        level: i64,
    ) {
        connection
            .execute(
                "
                INSERT INTO process_nodes(id, model_key, pcf_id, code, name, description, parent_id, level)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![id, model_key, pcf_id, code, name, description, parent_id, level],
            )
            .expect("insert node");
    }

    pub(crate) fn set_setting(connection: &Connection, key: &str, value: &str) {
        connection
            .execute(
                "INSERT OR REPLACE INTO admin_settings(key, value) VALUES(?1, ?2)",
                params![key, value],
            )
            .expect("insert setting");
    }

    pub(crate) fn usecase_count(connection: &Connection, node_id: i64) -> i64 {
        connection
            .query_row(
                "SELECT COUNT(*) FROM usecase_candidates WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .expect("count candidates")
    }
}
