use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{Category, CategoryId, Item, ItemId};

const ITEM_COLUMNS: &str = "id, category_id, text, active, created_at, revision, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_category(&self, name: &str) -> Result<CategoryId> {
        let rec = sqlx::query(
            "INSERT INTO categories (name) VALUES (?)
             ON CONFLICT(name) DO UPDATE SET name=excluded.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create category '{name}'"))?;
        Ok(CategoryId(rec.get::<i64, _>(0)))
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query("SELECT id, name FROM categories ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Category {
                id: CategoryId(r.get::<i64, _>(0)),
                name: r.get::<String, _>(1),
            })
            .collect())
    }

    pub async fn category_exists(&self, category_id: CategoryId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM categories WHERE id = ?")
            .bind(category_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_item(&self, category_id: CategoryId, text: &str) -> Result<Item> {
        self.insert_item_at(category_id, text, Utc::now()).await
    }

    /// Inserts an item with an explicit creation time; display order within
    /// the category follows `created_at`.
    pub async fn insert_item_at(
        &self,
        category_id: CategoryId,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Item> {
        let row = sqlx::query(&format!(
            "INSERT INTO items (category_id, text, active, revision, created_at, updated_at)
             VALUES (?, ?, 0, 1, ?, ?)
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(category_id.0)
        .bind(text)
        .bind(created_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert item into category {}", category_id.0))?;
        Ok(item_from_row(&row))
    }

    pub async fn get_item(&self, item_id: ItemId) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(item_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(item_from_row))
    }

    pub async fn list_items(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS}
             FROM items
             WHERE category_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(category_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(item_from_row).collect())
    }

    /// Writes the `active` flag of one row and bumps its revision. Returns
    /// `None` when the row does not exist.
    pub async fn set_active(&self, item_id: ItemId, active: bool) -> Result<Option<Item>> {
        let row = sqlx::query(&format!(
            "UPDATE items
             SET active = ?, revision = revision + 1, updated_at = ?
             WHERE id = ?
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(active)
        .bind(Utc::now())
        .bind(item_id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to set active={active} on item {}", item_id.0))?;
        Ok(row.as_ref().map(item_from_row))
    }

    /// Clears the `active` flag on every active row of the category and
    /// returns the rows that changed.
    pub async fn deactivate_category(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "UPDATE items
             SET active = 0, revision = revision + 1, updated_at = ?
             WHERE category_id = ? AND active = 1
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(category_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to deactivate category {}", category_id.0))?;
        let mut items: Vec<Item> = rows.iter().map(item_from_row).collect();
        items.sort_by(|a, b| a.display_order(b));
        Ok(items)
    }

    /// Deletes one row and returns it as it was last stored.
    pub async fn delete_item(&self, item_id: ItemId) -> Result<Option<Item>> {
        let row = sqlx::query(&format!(
            "DELETE FROM items WHERE id = ? RETURNING {ITEM_COLUMNS}"
        ))
        .bind(item_id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to delete item {}", item_id.0))?;
        Ok(row.as_ref().map(item_from_row))
    }
}

fn item_from_row(r: &SqliteRow) -> Item {
    Item {
        id: ItemId(r.get::<i64, _>(0)),
        category_id: CategoryId(r.get::<i64, _>(1)),
        text: r.get::<String, _>(2),
        active: r.get::<bool, _>(3),
        created_at: r.get::<DateTime<Utc>, _>(4),
        revision: r.get::<i64, _>(5),
        updated_at: r.get::<DateTime<Utc>, _>(6),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
