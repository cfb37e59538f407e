//! Product queries.

use opsd_core::product::{Product, ProductStatus, RiskLevel};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn row_to_product(row: &Row<'_>) -> Result<Product, StoreError> {
    let status: String = row.get("status")?;
    let risk: String = row.get("risk_level")?;
    Ok(Product {
        id: row.get("id")?,
        name: row.get("name")?,
        status: status
            .parse::<ProductStatus>()
            .map_err(|e| StoreError::corrupt(format!("products.status: {e}")))?,
        risk_level: risk
            .parse::<RiskLevel>()
            .map_err(|e| StoreError::corrupt(format!("products.risk_level: {e}")))?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Upserts a product by id, preserving `created_at` on replace.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn upsert(conn: &Connection, product: &Product) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO products (id, name, status, risk_level, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (id) DO UPDATE SET
             name = excluded.name,
             status = excluded.status,
             risk_level = excluded.risk_level,
             updated_at = excluded.updated_at",
        params![
            product.id,
            product.name,
            product.status.as_str(),
            product.risk_level.as_str(),
            product.created_at,
            product.updated_at,
        ],
    )?;
    Ok(())
}

/// Fetches one product by id.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Product>, StoreError> {
    let product = conn
        .query_row(
            "SELECT * FROM products WHERE id = ?1",
            params![id],
            |row| Ok(row_to_product(row)),
        )
        .optional()?;
    product.transpose()
}

/// Lists all products, sorted by id.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn list(conn: &Connection) -> Result<Vec<Product>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM products ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| Ok(row_to_product(row)))?;
    let mut products = Vec::new();
    for row in rows {
        products.push(row??);
    }
    Ok(products)
}

#[cfg(test)]
mod tests {
    use opsd_core::id::now_iso;

    use super::*;
    use crate::store::Store;

    fn product(id: &str, created_at: &str) -> Product {
        Product {
            id: id.to_string(),
            name: "Acme Site".to_string(),
            status: ProductStatus::Active,
            risk_level: RiskLevel::Normal,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        let original = product("site", "2026-01-01T00:00:00.000Z");
        upsert(&conn, &original).unwrap();

        let mut renamed = product("site", now_iso().as_str());
        renamed.name = "Acme Site v2".to_string();
        upsert(&conn, &renamed).unwrap();

        let loaded = get(&conn, "site").unwrap().unwrap();
        assert_eq!(loaded.name, "Acme Site v2");
        assert_eq!(loaded.created_at, "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_list_sorted() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        upsert(&conn, &product("zeta", "2026-01-01T00:00:00.000Z")).unwrap();
        upsert(&conn, &product("alpha", "2026-01-01T00:00:00.000Z")).unwrap();
        let ids: Vec<String> = list(&conn).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
