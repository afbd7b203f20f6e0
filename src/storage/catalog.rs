//! Resolve-or-create and relationship-replace operations on catalog entities.
//!
//! Every function takes a plain `&Connection` so callers decide the transaction
//! boundary; the upserter runs them inside one transaction per record.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{format_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};
use crate::domain::{Contributor, PersistedResource};
use crate::pipeline::languages;
use crate::types::{ValidatedContributor, ValidatedResource};

#[derive(Debug, Clone, Copy)]
enum NamedTable {
    Sources,
    Formats,
    Levels,
}

impl NamedTable {
    fn as_str(self) -> &'static str {
        match self {
            NamedTable::Sources => "sources",
            NamedTable::Formats => "formats",
            NamedTable::Levels => "levels",
        }
    }
}

fn resolve_named(conn: &Connection, table: NamedTable, name: &str) -> rusqlite::Result<Uuid> {
    let select = format!("SELECT id FROM {} WHERE name = ?1", table.as_str());
    let existing: Option<String> = conn
        .query_row(&select, params![name], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        return parse_uuid(0, id);
    }
    let id = Uuid::new_v4();
    let insert = format!("INSERT INTO {} (id, name) VALUES (?1, ?2)", table.as_str());
    conn.execute(&insert, params![id.to_string(), name])?;
    Ok(id)
}

pub fn resolve_source(conn: &Connection, name: &str) -> rusqlite::Result<Uuid> {
    resolve_named(conn, NamedTable::Sources, name)
}

pub fn resolve_format(conn: &Connection, name: &str) -> rusqlite::Result<Uuid> {
    resolve_named(conn, NamedTable::Formats, name)
}

pub fn resolve_level(conn: &Connection, name: &str) -> rusqlite::Result<Uuid> {
    resolve_named(conn, NamedTable::Levels, name)
}

pub fn find_source(conn: &Connection, name: &str) -> rusqlite::Result<Option<Uuid>> {
    conn.query_row("SELECT id FROM sources WHERE name = ?1", params![name], |row| {
        parse_uuid(0, row.get(0)?)
    })
    .optional()
}

/// Creates the language on first use; the display name comes from the built-in table.
pub fn resolve_language(conn: &Connection, iso_code: &str) -> rusqlite::Result<String> {
    let name = languages::display_name(iso_code).unwrap_or(iso_code);
    conn.execute(
        "INSERT OR IGNORE INTO languages (iso_code, name) VALUES (?1, ?2)",
        params![iso_code, name],
    )?;
    Ok(iso_code.to_string())
}

/// Tags are content-addressed: the id is derived from the cleaned name.
pub fn tag_id(clean_name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, clean_name.as_bytes())
}

pub fn resolve_tag(conn: &Connection, clean_name: &str) -> rusqlite::Result<Uuid> {
    let id = tag_id(clean_name);
    conn.execute(
        "INSERT OR IGNORE INTO tags (id, name) VALUES (?1, ?2)",
        params![id.to_string(), clean_name],
    )?;
    Ok(id)
}

/// Finds a contributor by (source, local id), refreshing its descriptive fields,
/// or creates it.
pub fn upsert_contributor(
    conn: &Connection,
    source_id: Uuid,
    contributor: &ValidatedContributor,
) -> rusqlite::Result<(Uuid, bool)> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM contributors WHERE source_id = ?1 AND local_id = ?2",
            params![source_id.to_string(), contributor.local_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE contributors SET name = ?1, url = ?2, thumbnail_url = ?3, description = ?4
                 WHERE id = ?5",
                params![
                    contributor.name,
                    contributor.url,
                    contributor.thumbnail_url,
                    contributor.description,
                    id
                ],
            )?;
            Ok((parse_uuid(0, id)?, false))
        }
        None => {
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO contributors (id, source_id, local_id, name, url, thumbnail_url, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    source_id.to_string(),
                    contributor.local_id,
                    contributor.name,
                    contributor.url,
                    contributor.thumbnail_url,
                    contributor.description
                ],
            )?;
            Ok((id, true))
        }
    }
}

pub fn find_resource_id(conn: &Connection, source_id: Uuid, local_id: &str) -> rusqlite::Result<Option<Uuid>> {
    conn.query_row(
        "SELECT id FROM resources WHERE source_id = ?1 AND local_id = ?2",
        params![source_id.to_string(), local_id],
        |row| parse_uuid(0, row.get(0)?),
    )
    .optional()
}

/// Dedupe read for resources, keyed on the source name and local id.
pub fn resource_exists(conn: &Connection, source: &str, local_id: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM resources r JOIN sources s ON s.id = r.source_id
         WHERE s.name = ?1 AND r.local_id = ?2 LIMIT 1",
    )?;
    stmt.exists(params![source, local_id])
}

/// Dedupe read for contributors, keyed on the source name and local contributor id.
pub fn contributor_exists(conn: &Connection, source: &str, local_id: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM contributors c JOIN sources s ON s.id = c.source_id
         WHERE s.name = ?1 AND c.local_id = ?2 LIMIT 1",
    )?;
    stmt.exists(params![source, local_id])
}

/// Foreign keys resolved for a resource row.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRefs {
    pub source_id: Uuid,
    pub format_id: Option<Uuid>,
    pub level_id: Option<Uuid>,
}

pub fn insert_resource(
    conn: &Connection,
    refs: ResourceRefs,
    resource: &ValidatedResource,
    now: DateTime<Utc>,
) -> rusqlite::Result<Uuid> {
    let id = Uuid::new_v4();
    let now = format_ts(&now);
    conn.execute(
        "INSERT INTO resources (
            id, source_id, local_id, name, description, short_description, html_description,
            url, thumbnail_url, is_free, is_limited_free, is_active, has_certificate,
            price, duration_hours, reviews_count, reviews_rating, enrollment_count,
            format_id, level_id, last_update, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            id.to_string(),
            refs.source_id.to_string(),
            resource.local_id,
            resource.name,
            resource.description,
            resource.short_description,
            resource.html_description,
            resource.url,
            resource.thumbnail_url,
            resource.is_free,
            resource.is_limited_free,
            resource.is_active,
            resource.has_certificate,
            resource.price,
            resource.duration_hours,
            resource.reviews_count,
            resource.reviews_rating,
            resource.enrollment_count,
            refs.format_id.map(|id| id.to_string()),
            refs.level_id.map(|id| id.to_string()),
            resource.last_update.as_ref().map(format_ts),
            now,
            now
        ],
    )?;
    Ok(id)
}

/// Refreshes every scalar column; identity and `created_at` are left alone.
pub fn update_resource(
    conn: &Connection,
    id: Uuid,
    refs: ResourceRefs,
    resource: &ValidatedResource,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE resources SET
            name = ?1, description = ?2, short_description = ?3, html_description = ?4,
            url = ?5, thumbnail_url = ?6, is_free = ?7, is_limited_free = ?8, is_active = ?9,
            has_certificate = ?10, price = ?11, duration_hours = ?12, reviews_count = ?13,
            reviews_rating = ?14, enrollment_count = ?15, format_id = ?16, level_id = ?17,
            last_update = ?18, updated_at = ?19
         WHERE id = ?20",
        params![
            resource.name,
            resource.description,
            resource.short_description,
            resource.html_description,
            resource.url,
            resource.thumbnail_url,
            resource.is_free,
            resource.is_limited_free,
            resource.is_active,
            resource.has_certificate,
            resource.price,
            resource.duration_hours,
            resource.reviews_count,
            resource.reviews_rating,
            resource.enrollment_count,
            refs.format_id.map(|id| id.to_string()),
            refs.level_id.map(|id| id.to_string()),
            resource.last_update.as_ref().map(format_ts),
            format_ts(&now),
            id.to_string()
        ],
    )?;
    Ok(())
}

pub fn replace_contributors(conn: &Connection, resource_id: Uuid, contributor_ids: &[Uuid]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM resource_contributors WHERE resource_id = ?1",
        params![resource_id.to_string()],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO resource_contributors (resource_id, contributor_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, contributor_id) in contributor_ids.iter().enumerate() {
        stmt.execute(params![resource_id.to_string(), contributor_id.to_string(), position as i64])?;
    }
    Ok(())
}

pub fn replace_languages(conn: &Connection, resource_id: Uuid, codes: &[String]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM resource_languages WHERE resource_id = ?1",
        params![resource_id.to_string()],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO resource_languages (resource_id, language_code) VALUES (?1, ?2)",
    )?;
    for code in codes {
        stmt.execute(params![resource_id.to_string(), code])?;
    }
    Ok(())
}

pub fn replace_tags(conn: &Connection, resource_id: Uuid, tag_ids: &[Uuid]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM resource_tags WHERE resource_id = ?1",
        params![resource_id.to_string()],
    )?;
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO resource_tags (resource_id, tag_id) VALUES (?1, ?2)")?;
    for tag_id in tag_ids {
        stmt.execute(params![resource_id.to_string(), tag_id.to_string()])?;
    }
    Ok(())
}

const RESOURCE_COLUMNS: &str = "r.id, r.source_id, r.local_id, r.name, r.description, r.short_description,
    r.html_description, r.url, r.thumbnail_url, r.is_free, r.is_limited_free, r.is_active,
    r.has_certificate, r.price, r.duration_hours, r.reviews_count, r.reviews_rating,
    r.enrollment_count, r.format_id, r.level_id, r.last_update, r.created_at, r.updated_at";

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedResource> {
    Ok(PersistedResource {
        id: parse_uuid(0, row.get(0)?)?,
        source_id: parse_uuid(1, row.get(1)?)?,
        local_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        short_description: row.get(5)?,
        html_description: row.get(6)?,
        url: row.get(7)?,
        thumbnail_url: row.get(8)?,
        is_free: row.get(9)?,
        is_limited_free: row.get(10)?,
        is_active: row.get(11)?,
        has_certificate: row.get(12)?,
        price: row.get(13)?,
        duration_hours: row.get(14)?,
        reviews_count: row.get(15)?,
        reviews_rating: row.get(16)?,
        enrollment_count: row.get(17)?,
        format_id: parse_opt_uuid(18, row.get(18)?)?,
        level_id: parse_opt_uuid(19, row.get(19)?)?,
        last_update: parse_opt_ts(20, row.get(20)?)?,
        created_at: parse_ts(21, row.get(21)?)?,
        updated_at: parse_ts(22, row.get(22)?)?,
        contributor_ids: Vec::new(),
        language_codes: Vec::new(),
        tag_names: Vec::new(),
    })
}

/// Loads a resource with its relationship sets by row id.
pub fn load_resource(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<PersistedResource>> {
    let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources r WHERE r.id = ?1");
    let resource = conn
        .query_row(&sql, params![id.to_string()], resource_from_row)
        .optional()?;
    resource.map(|r| attach_relationships(conn, r)).transpose()
}

/// Reads a resource by its natural key.
pub fn find_resource(conn: &Connection, source: &str, local_id: &str) -> rusqlite::Result<Option<PersistedResource>> {
    let sql = format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources r JOIN sources s ON s.id = r.source_id
         WHERE s.name = ?1 AND r.local_id = ?2"
    );
    let resource = conn
        .query_row(&sql, params![source, local_id], resource_from_row)
        .optional()?;
    resource.map(|r| attach_relationships(conn, r)).transpose()
}

fn attach_relationships(conn: &Connection, mut resource: PersistedResource) -> rusqlite::Result<PersistedResource> {
    let id = resource.id.to_string();

    let mut stmt = conn.prepare_cached(
        "SELECT contributor_id FROM resource_contributors WHERE resource_id = ?1 ORDER BY position",
    )?;
    let contributor_ids = stmt
        .query_map(params![id], |row| parse_uuid(0, row.get(0)?))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT language_code FROM resource_languages WHERE resource_id = ?1 ORDER BY language_code",
    )?;
    let language_codes = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT t.name FROM resource_tags rt JOIN tags t ON t.id = rt.tag_id
         WHERE rt.resource_id = ?1 ORDER BY t.name",
    )?;
    let tag_names = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    resource.contributor_ids = contributor_ids;
    resource.language_codes = language_codes;
    resource.tag_names = tag_names;
    Ok(resource)
}

pub fn find_contributor(conn: &Connection, source: &str, local_id: &str) -> rusqlite::Result<Option<Contributor>> {
    conn.query_row(
        "SELECT c.id, c.source_id, c.local_id, c.name, c.url, c.thumbnail_url, c.description
         FROM contributors c JOIN sources s ON s.id = c.source_id
         WHERE s.name = ?1 AND c.local_id = ?2",
        params![source, local_id],
        |row| {
            Ok(Contributor {
                id: parse_uuid(0, row.get(0)?)?,
                source_id: parse_uuid(1, row.get(1)?)?,
                local_id: row.get(2)?,
                name: row.get(3)?,
                url: row.get(4)?,
                thumbnail_url: row.get(5)?,
                description: row.get(6)?,
            })
        },
    )
    .optional()
}

pub fn count_resources(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))
}
