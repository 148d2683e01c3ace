// ==============================================================================
// grouping.rs - Group Index
// ==============================================================================
// Description: Temporary variant-to-group table used by an association run
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// __asso_tmp (variant_id, <group fields>, _ignored) is dropped and rebuilt at
// the start of every run. Groups are read from it once; setting _ignored is
// the only change allowed afterwards and happens before workers start.
// ==============================================================================

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{ConfigError, PipelineResult};
use crate::models::{GroupKey, GroupValue, VariantId};
use crate::store::{check_identifier, table_columns};

pub const GROUP_TABLE: &str = "__asso_tmp";

/// Check grouping fields against the variant table
pub fn validate_group_fields(conn: &Connection, group_by: &[String]) -> Result<(), ConfigError> {
    if group_by.is_empty() {
        return Err(ConfigError::Setting("at least one group-by field is required".into()));
    }
    let columns = table_columns(conn, "main", "variant")
        .map_err(|e| ConfigError::Setting(format!("cannot read variant table: {}", e)))?;
    for field in group_by {
        check_identifier(field)?;
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(field)) {
            return Err(ConfigError::Setting(format!("group-by field {} is not a variant field", field)));
        }
    }
    Ok(())
}

/// `c1 IS ?1 AND c2 IS ?2 ...`; IS matches NULL group values too
pub fn group_condition(group_by: &[String], alias: &str) -> String {
    group_by
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{}{} IS ?{}", alias, f, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Rebuild the group index from the variant table
pub fn build_group_index(conn: &Connection, group_by: &[String]) -> PipelineResult<()> {
    let fields = group_by.join(", ");
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {table};
         CREATE TABLE {table} AS SELECT variant_id, {fields}, 0 AS _ignored FROM variant;
         CREATE INDEX {table}_variant ON {table} (variant_id);
         CREATE INDEX {table}_group ON {table} ({fields});",
        table = GROUP_TABLE,
        fields = fields
    ))?;
    Ok(())
}

pub fn distinct_groups(conn: &Connection, group_by: &[String]) -> PipelineResult<Vec<GroupKey>> {
    let fields = group_by.join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT {0} FROM {1} WHERE _ignored = 0 ORDER BY {0}",
        fields, GROUP_TABLE
    ))?;
    let groups = stmt
        .query_map([], |row| {
            (0..group_by.len())
                .map(|i| row.get::<_, GroupValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map(GroupKey)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    debug!("{} groups by {}", groups.len(), fields);
    Ok(groups)
}

/// Exclude a group from this run
pub fn mark_ignored(conn: &Connection, group_by: &[String], key: &GroupKey) -> PipelineResult<()> {
    conn.prepare_cached(&format!(
        "UPDATE {} SET _ignored = 1 WHERE {}",
        GROUP_TABLE,
        group_condition(group_by, "")
    ))?
    .execute(params_from_iter(key.values()))?;
    Ok(())
}

/// Variant ids of a group, ascending
pub fn variants_of_group(
    conn: &Connection,
    schema: &str,
    group_by: &[String],
    key: &GroupKey,
) -> rusqlite::Result<Vec<VariantId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT variant_id FROM {}.{} WHERE _ignored = 0 AND {} ORDER BY variant_id",
        schema,
        GROUP_TABLE,
        group_condition(group_by, "")
    ))?;
    let ids = stmt
        .query_map(params_from_iter(key.values()), |row| row.get::<_, i64>(0))?
        .map(|id| id.map(|id| id as VariantId))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}
