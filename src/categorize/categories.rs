use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{Business, Category, CategoryScope, OwnerProfile, TransactionType};

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        scope: row.get(3)?,
        category_type: row.get(4)?,
    })
}

/// Categories an owner may pick from: system categories in scope for the
/// owner's usage type, plus the owner's own, minus soft-deleted ones.
pub async fn available_categories(
    db: &Database,
    owner_id: &str,
    type_filter: Option<TransactionType>,
) -> Result<Vec<Category>> {
    let profile = get_profile(db, owner_id).await?;
    let owner = owner_id.to_string();
    let mut categories = db
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, scope, category_type FROM categories \
                 WHERE deleted_at IS NULL AND (owner_id IS NULL OR owner_id = ?1) \
                 ORDER BY category_type, name",
            )?;
            let rows = stmt
                .query_map([owner], category_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

    let usage = profile.usage_type.unwrap_or(CategoryScope::Both);
    categories.retain(|c| {
        let in_scope = c.owner_id.is_some()
            || usage == CategoryScope::Both
            || c.scope == CategoryScope::Both
            || c.scope == usage;
        in_scope && type_filter.map_or(true, |t| c.category_type == t)
    });
    Ok(categories)
}

pub async fn create_category(
    db: &Database,
    owner_id: &str,
    name: &str,
    scope: CategoryScope,
    category_type: TransactionType,
) -> Result<Category> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(SpendsortError::Validation("category name must not be empty".into()));
    }
    let owner = owner_id.to_string();
    db.call(move |conn| {
        let clash: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM categories WHERE lower(name) = lower(?1) AND deleted_at IS NULL \
             AND (owner_id IS NULL OR owner_id = ?2))",
            params![name, owner],
            |row| row.get(0),
        )?;
        if clash {
            return Err(SpendsortError::Validation(format!("category already exists: {name}")));
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO categories (id, owner_id, name, scope, category_type) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner, name, scope, category_type],
        )?;
        Ok(Category {
            id,
            owner_id: Some(owner),
            name,
            scope,
            category_type,
        })
    })
    .await
}

/// Soft delete; only the owner's own categories can be removed.
pub async fn delete_category(db: &Database, owner_id: &str, category_id: &str) -> Result<()> {
    let owner = owner_id.to_string();
    let id = category_id.to_string();
    db.call(move |conn| {
        let changed = conn.execute(
            "UPDATE categories SET deleted_at = ?1 WHERE id = ?2 AND owner_id = ?3 AND deleted_at IS NULL",
            params![Utc::now(), id, owner],
        )?;
        if changed == 0 {
            return Err(SpendsortError::NotFound(format!("category {id}")));
        }
        Ok(())
    })
    .await
}

pub async fn get_profile(db: &Database, owner_id: &str) -> Result<OwnerProfile> {
    let owner = owner_id.to_string();
    db.call(move |conn| {
        let row: Option<(Option<String>, Option<CategoryScope>)> = conn
            .query_row(
                "SELECT country, usage_type FROM owner_profiles WHERE owner_id = ?1",
                [&owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (country, usage_type) = row.unwrap_or((None, None));
        let mut stmt =
            conn.prepare("SELECT id, name FROM businesses WHERE owner_id = ?1 ORDER BY name")?;
        let businesses = stmt
            .query_map([&owner], |row| {
                Ok(Business {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(OwnerProfile {
            country,
            usage_type,
            businesses,
        })
    })
    .await
}

pub async fn set_profile(
    db: &Database,
    owner_id: &str,
    country: Option<String>,
    usage_type: Option<CategoryScope>,
) -> Result<()> {
    let owner = owner_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "INSERT INTO owner_profiles (owner_id, country, usage_type) VALUES (?1, ?2, ?3) \
             ON CONFLICT(owner_id) DO UPDATE SET country = excluded.country, usage_type = excluded.usage_type",
            params![owner, country, usage_type],
        )?;
        Ok(())
    })
    .await
}

pub async fn add_business(db: &Database, owner_id: &str, name: &str) -> Result<Business> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(SpendsortError::Validation("business name must not be empty".into()));
    }
    let owner = owner_id.to_string();
    db.call(move |conn| {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO businesses (id, owner_id, name) VALUES (?1, ?2, ?3)",
            params![id, owner, name],
        )?;
        Ok(Business { id, name })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn names(categories: &[Category]) -> Vec<&str> {
        categories.iter().map(|c| c.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_personal_owner_sees_no_business_categories() {
        let (_dir, db) = test_db();
        set_profile(&db, "owner-1", Some("US".into()), Some(CategoryScope::Personal))
            .await
            .unwrap();
        let cats = available_categories(&db, "owner-1", None).await.unwrap();
        let names = names(&cats);
        assert!(names.contains(&"Groceries"));
        assert!(names.contains(&"Travel"));
        assert!(!names.contains(&"Software & SaaS"));
    }

    #[tokio::test]
    async fn test_both_usage_sees_everything_and_filters_by_type() {
        let (_dir, db) = test_db();
        let all = available_categories(&db, "owner-1", None).await.unwrap();
        assert!(names(&all).contains(&"Software & SaaS"));
        let income = available_categories(&db, "owner-1", Some(TransactionType::Income))
            .await
            .unwrap();
        assert!(income.iter().all(|c| c.category_type == TransactionType::Income));
        assert!(names(&income).contains(&"Salary"));
    }

    #[tokio::test]
    async fn test_custom_categories_are_private_and_soft_deleted() {
        let (_dir, db) = test_db();
        set_profile(&db, "owner-1", None, Some(CategoryScope::Personal))
            .await
            .unwrap();
        let custom = create_category(
            &db,
            "owner-1",
            "Pet Care",
            CategoryScope::Business,
            TransactionType::Expense,
        )
        .await
        .unwrap();
        assert!(names(&available_categories(&db, "owner-1", None).await.unwrap()).contains(&"Pet Care"));
        assert!(!names(&available_categories(&db, "owner-2", None).await.unwrap()).contains(&"Pet Care"));

        let err = delete_category(&db, "owner-2", &custom.id).await.unwrap_err();
        assert!(matches!(err, SpendsortError::NotFound(_)));
        delete_category(&db, "owner-1", &custom.id).await.unwrap();
        assert!(!names(&available_categories(&db, "owner-1", None).await.unwrap()).contains(&"Pet Care"));
    }

    #[tokio::test]
    async fn test_duplicate_category_name_rejected() {
        let (_dir, db) = test_db();
        let err = create_category(&db, "owner-1", "groceries", CategoryScope::Personal, TransactionType::Expense)
            .await
            .unwrap_err();
        assert!(matches!(err, SpendsortError::Validation(_)));
    }

    #[tokio::test]
    async fn test_profile_with_businesses() {
        let (_dir, db) = test_db();
        assert!(get_profile(&db, "owner-1").await.unwrap().businesses.is_empty());
        add_business(&db, "owner-1", "Acme Studio").await.unwrap();
        set_profile(&db, "owner-1", Some("CA".into()), Some(CategoryScope::Both))
            .await
            .unwrap();
        let profile = get_profile(&db, "owner-1").await.unwrap();
        assert_eq!(profile.country.as_deref(), Some("CA"));
        assert_eq!(profile.businesses.len(), 1);
        assert_eq!(profile.businesses[0].name, "Acme Studio");
    }
}
