//! Idempotent writes for titles, agencies, and references.
//!
//! Every function takes a `&mut SqliteConnection` so callers decide the
//! transaction scope: pass `&mut *tx` to run inside an open transaction.
//! Rows are matched on their natural keys (title number, agency slug, the
//! reference 4-tuple), never on surrogate ids, which makes re-running any
//! ingestion phase safe.

use anyhow::{anyhow, bail, Result};
use sqlx::{Row, SqliteConnection};

use crate::models::{Agency, AgencyNode, RefTuple, Reference, Title, TitleRecord};

/// Row counts touched by an agency tree upsert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgencyTally {
    pub agencies: u64,
    pub references_created: u64,
    pub links_created: u64,
}

// ============ References ============

/// Returns the reference stored under `key`, creating it with no content
/// when absent. Absent components compare equal to each other.
pub async fn resolve_reference(conn: &mut SqliteConnection, key: &RefTuple) -> Result<Reference> {
    Ok(resolve_reference_inner(conn, key).await?.0)
}

async fn resolve_reference_inner(
    conn: &mut SqliteConnection,
    key: &RefTuple,
) -> Result<(Reference, bool)> {
    let existing = sqlx::query(
        r#"
        SELECT id, content FROM cfr_references
        WHERE title = ? AND chapter IS ? AND part IS ? AND subchapter IS ?
        "#,
    )
    .bind(&key.title)
    .bind(&key.chapter)
    .bind(&key.part)
    .bind(&key.subchapter)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        return Ok((reference_from_key(row.get("id"), key, row.get("content")), false));
    }

    // A concurrent insert of the same key fails the unique index here; that
    // is an integrity error and propagates.
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO cfr_references (title, chapter, part, subchapter, content)
        VALUES (?, ?, ?, ?, NULL)
        RETURNING id
        "#,
    )
    .bind(&key.title)
    .bind(&key.chapter)
    .bind(&key.part)
    .bind(&key.subchapter)
    .fetch_one(&mut *conn)
    .await?;

    Ok((reference_from_key(id, key, None), true))
}

fn reference_from_key(id: i64, key: &RefTuple, content: Option<String>) -> Reference {
    Reference {
        id,
        title: key.title.clone(),
        chapter: key.chapter.clone(),
        part: key.part.clone(),
        subchapter: key.subchapter.clone(),
        content,
    }
}

/// Associates an agency with a reference. Returns `false` when the pair
/// was already linked.
pub async fn link_reference(
    conn: &mut SqliteConnection,
    agency_id: i64,
    reference_id: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO agency_cfr_references (agency_id, cfr_reference_id) VALUES (?, ?)
        ON CONFLICT(agency_id, cfr_reference_id) DO NOTHING
        "#,
    )
    .bind(agency_id)
    .bind(reference_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Replaces a reference's content and its full-text index entry.
pub async fn set_reference_content(
    conn: &mut SqliteConnection,
    reference_id: i64,
    content: &str,
) -> Result<()> {
    sqlx::query("UPDATE cfr_references SET content = ? WHERE id = ?")
        .bind(content)
        .bind(reference_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM cfr_references_fts WHERE reference_id = ?")
        .bind(reference_id)
        .execute(&mut *conn)
        .await?;

    if !content.is_empty() {
        sqlx::query("INSERT INTO cfr_references_fts (reference_id, content) VALUES (?, ?)")
            .bind(reference_id)
            .bind(content)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

// ============ Agencies ============

/// Merges an agency tree into the store and returns the root agency.
///
/// Nodes are visited depth-first in pre-order. Each node is matched by
/// slug: a new slug is inserted, a known slug has its names and parent
/// overwritten. References are resolved through [`resolve_reference`] and
/// linked at most once per agency.
pub async fn upsert_agency(
    conn: &mut SqliteConnection,
    node: &AgencyNode,
    parent_id: Option<i64>,
) -> Result<Agency> {
    let mut tally = AgencyTally::default();
    upsert_agency_counted(conn, node, parent_id, &mut tally).await
}

/// [`upsert_agency`] that also accumulates row counts into `tally`.
pub async fn upsert_agency_counted(
    conn: &mut SqliteConnection,
    node: &AgencyNode,
    parent_id: Option<i64>,
    tally: &mut AgencyTally,
) -> Result<Agency> {
    // Explicit frontier instead of async recursion; children are pushed in
    // reverse so they pop in feed order.
    let mut stack: Vec<(&AgencyNode, Option<i64>)> = vec![(node, parent_id)];
    let mut root: Option<Agency> = None;

    while let Some((current, parent)) = stack.pop() {
        let agency = upsert_agency_row(conn, current, parent).await?;
        tally.agencies += 1;

        for key in &current.references {
            let (reference, created) = resolve_reference_inner(conn, key).await?;
            if created {
                tally.references_created += 1;
            }
            if link_reference(conn, agency.id, reference.id).await? {
                tally.links_created += 1;
            }
        }

        for child in current.children.iter().rev() {
            stack.push((child, Some(agency.id)));
        }

        if root.is_none() {
            root = Some(agency);
        }
    }

    root.ok_or_else(|| anyhow!("agency tree for '{}' produced no rows", node.slug))
}

async fn upsert_agency_row(
    conn: &mut SqliteConnection,
    node: &AgencyNode,
    parent_id: Option<i64>,
) -> Result<Agency> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM agencies WHERE slug = ?")
        .bind(&node.slug)
        .fetch_optional(&mut *conn)
        .await?;

    let (id, created_at) = match existing {
        Some(id) => {
            if let Some(parent) = parent_id {
                if is_ancestor_or_self(conn, id, parent).await? {
                    bail!(
                        "placing agency '{}' under agency {} would create a cycle",
                        node.slug,
                        parent
                    );
                }
            }

            let created_at: i64 = sqlx::query_scalar(
                r#"
                UPDATE agencies SET
                    name = ?,
                    short_name = ?,
                    display_name = ?,
                    sortable_name = ?,
                    parent_id = ?
                WHERE id = ?
                RETURNING created_at
                "#,
            )
            .bind(&node.name)
            .bind(&node.short_name)
            .bind(&node.display_name)
            .bind(&node.sortable_name)
            .bind(parent_id)
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
            (id, created_at)
        }
        None => {
            let now = chrono::Utc::now().timestamp();
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO agencies (name, short_name, display_name, sortable_name, slug, parent_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&node.name)
            .bind(&node.short_name)
            .bind(&node.display_name)
            .bind(&node.sortable_name)
            .bind(&node.slug)
            .bind(parent_id)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;
            (id, now)
        }
    };

    Ok(Agency {
        id,
        name: node.name.clone(),
        short_name: node.short_name.clone(),
        display_name: node.display_name.clone(),
        sortable_name: node.sortable_name.clone(),
        slug: node.slug.clone(),
        parent_id,
        created_at,
    })
}

/// True when `agency_id` is `candidate` or one of its ancestors.
async fn is_ancestor_or_self(
    conn: &mut SqliteConnection,
    agency_id: i64,
    candidate: i64,
) -> Result<bool> {
    let found: bool = sqlx::query_scalar(
        r#"
        WITH RECURSIVE chain(id, parent_id) AS (
            SELECT id, parent_id FROM agencies WHERE id = ?
            UNION
            SELECT a.id, a.parent_id FROM agencies a JOIN chain c ON a.id = c.parent_id
        )
        SELECT COUNT(*) > 0 FROM chain WHERE id = ?
        "#,
    )
    .bind(candidate)
    .bind(agency_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(found)
}

// ============ Titles ============

/// Inserts or fully overwrites the title with `record.number`.
pub async fn upsert_title(conn: &mut SqliteConnection, record: &TitleRecord) -> Result<Title> {
    let now = chrono::Utc::now().timestamp();

    let row = sqlx::query(
        r#"
        INSERT INTO titles (number, name, latest_amended_on, latest_issue_date, up_to_date_as_of, reserved, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(number) DO UPDATE SET
            name = excluded.name,
            latest_amended_on = excluded.latest_amended_on,
            latest_issue_date = excluded.latest_issue_date,
            up_to_date_as_of = excluded.up_to_date_as_of,
            reserved = excluded.reserved,
            updated_at = excluded.updated_at
        RETURNING created_at, updated_at
        "#,
    )
    .bind(record.number)
    .bind(&record.name)
    .bind(record.latest_amended_on.map(|d| d.to_string()))
    .bind(record.latest_issue_date.map(|d| d.to_string()))
    .bind(record.up_to_date_as_of.map(|d| d.to_string()))
    .bind(record.reserved)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Title {
        number: record.number,
        name: record.name.clone(),
        latest_amended_on: record.latest_amended_on,
        latest_issue_date: record.latest_issue_date,
        up_to_date_as_of: record.up_to_date_as_of,
        reserved: record.reserved,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    async fn test_pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let url = format!("sqlite://{}/ecfr.sqlite", tmp.path().display());
        let pool = db::connect_url(&url).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn node(slug: &str, refs: Vec<RefTuple>, children: Vec<AgencyNode>) -> AgencyNode {
        AgencyNode {
            name: slug.to_uppercase(),
            short_name: None,
            display_name: slug.to_uppercase(),
            sortable_name: slug.to_uppercase(),
            slug: slug.to_string(),
            references: refs,
            children,
        }
    }

    #[tokio::test]
    async fn resolving_same_tuple_twice_returns_same_row() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let key = RefTuple::new("7", Some("I"), Some("100"), None);

        let first = resolve_reference(&mut conn, &key).await.unwrap();
        let second = resolve_reference(&mut conn, &key).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.content, None);
        assert_eq!(count(&pool, "cfr_references").await, 1);
    }

    #[tokio::test]
    async fn tuples_differing_in_absent_component_stay_distinct() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let a = resolve_reference(&mut conn, &RefTuple::new("7", Some("I"), None, None))
            .await
            .unwrap();
        let b = resolve_reference(&mut conn, &RefTuple::new("7", Some("I"), Some("100"), None))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(count(&pool, "cfr_references").await, 2);
    }

    #[tokio::test]
    async fn duplicate_tuple_insert_is_rejected() {
        let (_tmp, pool) = test_pool().await;
        let insert = "INSERT INTO cfr_references (title, chapter, part, subchapter) VALUES ('7', 'I', '100', NULL)";

        sqlx::query(insert).execute(&pool).await.unwrap();
        let err = sqlx::query(insert).execute(&pool).await.unwrap_err();

        assert!(err.to_string().to_lowercase().contains("unique"));
    }

    #[tokio::test]
    async fn link_is_inserted_once() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let agency = upsert_agency(&mut conn, &node("usda", vec![], vec![]), None)
            .await
            .unwrap();
        let reference = resolve_reference(&mut conn, &RefTuple::new("7", None, None, None))
            .await
            .unwrap();

        assert!(link_reference(&mut conn, agency.id, reference.id).await.unwrap());
        assert!(!link_reference(&mut conn, agency.id, reference.id).await.unwrap());
        drop(conn);
        assert_eq!(count(&pool, "agency_cfr_references").await, 1);
    }

    #[tokio::test]
    async fn tree_parent_ids_follow_supplied_structure() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tree = node(
            "root",
            vec![],
            vec![node("child", vec![], vec![node("grandchild", vec![], vec![])])],
        );

        let root = upsert_agency(&mut conn, &tree, None).await.unwrap();
        assert_eq!(root.parent_id, None);

        let rows = sqlx::query("SELECT id, slug, parent_id FROM agencies")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        let id_of = |slug: &str| -> i64 {
            rows.iter()
                .find(|r| r.get::<String, _>("slug") == slug)
                .map(|r| r.get("id"))
                .unwrap()
        };
        let parent_of = |slug: &str| -> Option<i64> {
            rows.iter()
                .find(|r| r.get::<String, _>("slug") == slug)
                .map(|r| r.get("parent_id"))
                .unwrap()
        };

        assert_eq!(id_of("root"), root.id);
        assert_eq!(parent_of("root"), None);
        assert_eq!(parent_of("child"), Some(id_of("root")));
        assert_eq!(parent_of("grandchild"), Some(id_of("child")));
    }

    #[tokio::test]
    async fn agency_upsert_is_idempotent() {
        let (_tmp, pool) = test_pool().await;
        let shared = RefTuple::new("7", Some("I"), Some("100"), None);
        let tree = node(
            "usda",
            vec![shared.clone(), shared.clone()],
            vec![node("fsis", vec![shared.clone()], vec![])],
        );

        let mut conn = pool.acquire().await.unwrap();
        let mut first = AgencyTally::default();
        let a = upsert_agency_counted(&mut conn, &tree, None, &mut first)
            .await
            .unwrap();
        let mut second = AgencyTally::default();
        let b = upsert_agency_counted(&mut conn, &tree, None, &mut second)
            .await
            .unwrap();
        drop(conn);

        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(first.references_created, 1);
        assert_eq!(first.links_created, 2);
        assert_eq!(second.references_created, 0);
        assert_eq!(second.links_created, 0);
        assert_eq!(count(&pool, "agencies").await, 2);
        assert_eq!(count(&pool, "cfr_references").await, 1);
        assert_eq!(count(&pool, "agency_cfr_references").await, 2);
    }

    #[tokio::test]
    async fn agency_fields_are_overwritten_in_place() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut tree = node("usda", vec![], vec![]);
        let first = upsert_agency(&mut conn, &tree, None).await.unwrap();

        tree.name = "Department of Agriculture".to_string();
        tree.short_name = Some("USDA".to_string());
        let second = upsert_agency(&mut conn, &tree, None).await.unwrap();

        assert_eq!(first.id, second.id);
        let (name, short): (String, Option<String>) =
            sqlx::query_as("SELECT name, short_name FROM agencies WHERE slug = 'usda'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(name, "Department of Agriculture");
        assert_eq!(short.as_deref(), Some("USDA"));
    }

    #[tokio::test]
    async fn reparenting_under_descendant_is_refused() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tree = node("a", vec![], vec![node("b", vec![], vec![])]);
        upsert_agency(&mut conn, &tree, None).await.unwrap();

        let b_id: i64 = sqlx::query_scalar("SELECT id FROM agencies WHERE slug = 'b'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        let err = upsert_agency(&mut conn, &node("a", vec![], vec![]), Some(b_id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn title_upsert_overwrites_every_field() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut record = TitleRecord {
            number: 7,
            name: "Agriculture".to_string(),
            latest_amended_on: None,
            latest_issue_date: None,
            up_to_date_as_of: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
            reserved: false,
        };
        let first = upsert_title(&mut conn, &record).await.unwrap();

        record.name = "Agriculture (Updated)".to_string();
        record.up_to_date_as_of = None;
        record.reserved = true;
        let second = upsert_title(&mut conn, &record).await.unwrap();
        drop(conn);

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(count(&pool, "titles").await, 1);
        let (name, as_of, reserved): (String, Option<String>, bool) = sqlx::query_as(
            "SELECT name, up_to_date_as_of, reserved FROM titles WHERE number = 7",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(name, "Agriculture (Updated)");
        assert_eq!(as_of, None);
        assert!(reserved);
    }

    #[tokio::test]
    async fn content_update_refreshes_search_index() {
        let (_tmp, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let r = resolve_reference(&mut conn, &RefTuple::new("7", None, None, None))
            .await
            .unwrap();

        set_reference_content(&mut conn, r.id, "poultry inspection").await.unwrap();
        set_reference_content(&mut conn, r.id, "grain standards").await.unwrap();
        drop(conn);

        assert_eq!(count(&pool, "cfr_references_fts").await, 1);
        let hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cfr_references_fts WHERE cfr_references_fts MATCH 'grain'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(hits, 1);
    }
}
