use shared::{
    domain::{Category, CategoryId, Item, ItemId},
    error::{ApiError, ErrorCode},
    protocol::ChangeEvent,
};
use storage::Storage;
use tracing::debug;

const MAX_CATEGORY_NAME_CHARS: usize = 120;
const MAX_ITEM_TEXT_CHARS: usize = 4_000;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Result of a write: the stored value plus the change-feed events it
/// produced, in the order they must be published.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub value: T,
    pub events: Vec<ChangeEvent>,
}

pub async fn list_categories(ctx: &ApiContext) -> Result<Vec<Category>, ApiError> {
    ctx.storage.list_categories().await.map_err(internal)
}

pub async fn create_category(ctx: &ApiContext, name: &str) -> Result<Category, ApiError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_CATEGORY_NAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("category name must be 1..={MAX_CATEGORY_NAME_CHARS} characters"),
        ));
    }
    let id = ctx.storage.create_category(name).await.map_err(internal)?;
    Ok(Category {
        id,
        name: name.to_string(),
    })
}

pub async fn list_items(ctx: &ApiContext, category_id: CategoryId) -> Result<Vec<Item>, ApiError> {
    ensure_category(ctx, category_id).await?;
    ctx.storage.list_items(category_id).await.map_err(internal)
}

pub async fn create_item(
    ctx: &ApiContext,
    category_id: CategoryId,
    text: &str,
) -> Result<Mutation<Item>, ApiError> {
    if text.trim().is_empty() || text.chars().count() > MAX_ITEM_TEXT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("item text must be 1..={MAX_ITEM_TEXT_CHARS} characters"),
        ));
    }
    ensure_category(ctx, category_id).await?;
    let item = ctx
        .storage
        .insert_item(category_id, text)
        .await
        .map_err(internal)?;
    debug!(item_id = item.id.0, category_id = category_id.0, "item inserted");
    Ok(Mutation {
        events: vec![ChangeEvent::inserted(item.clone())],
        value: item,
    })
}

pub async fn set_active(
    ctx: &ApiContext,
    item_id: ItemId,
    active: bool,
) -> Result<Mutation<Item>, ApiError> {
    let item = ctx
        .storage
        .set_active(item_id, active)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "item not found"))?;
    debug!(
        item_id = item.id.0,
        active,
        revision = item.revision,
        "item active flag written"
    );
    Ok(Mutation {
        events: vec![ChangeEvent::updated(item.clone())],
        value: item,
    })
}

pub async fn deactivate_category(
    ctx: &ApiContext,
    category_id: CategoryId,
) -> Result<Mutation<Vec<Item>>, ApiError> {
    ensure_category(ctx, category_id).await?;
    let items = ctx
        .storage
        .deactivate_category(category_id)
        .await
        .map_err(internal)?;
    debug!(
        category_id = category_id.0,
        changed = items.len(),
        "category deactivated"
    );
    Ok(Mutation {
        events: items.iter().cloned().map(ChangeEvent::updated).collect(),
        value: items,
    })
}

pub async fn delete_item(ctx: &ApiContext, item_id: ItemId) -> Result<Mutation<Item>, ApiError> {
    let item = ctx
        .storage
        .delete_item(item_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "item not found"))?;
    Ok(Mutation {
        events: vec![ChangeEvent::deleted(item.clone())],
        value: item,
    })
}

async fn ensure_category(ctx: &ApiContext, category_id: CategoryId) -> Result<(), ApiError> {
    let exists = ctx
        .storage
        .category_exists(category_id)
        .await
        .map_err(internal)?;
    if !exists {
        return Err(ApiError::new(ErrorCode::NotFound, "category not found"));
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::ChangeKind;

    async fn setup() -> (ApiContext, CategoryId) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let category = storage.create_category("Salmos").await.expect("category");
        (ApiContext { storage }, category)
    }

    #[tokio::test]
    async fn listing_items_of_unknown_category_is_not_found() {
        let (ctx, _) = setup().await;
        let err = list_items(&ctx, CategoryId(404))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn blank_item_text_is_rejected() {
        let (ctx, category) = setup().await;
        let err = create_item(&ctx, category, "   ")
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn set_active_emits_one_update_event_with_the_new_revision() {
        let (ctx, category) = setup().await;
        let created = create_item(&ctx, category, "v1").await.expect("item");
        assert_eq!(created.events[0].event_type, ChangeKind::Insert);

        let written = set_active(&ctx, created.value.id, true)
            .await
            .expect("write");
        assert_eq!(written.events.len(), 1);
        assert_eq!(written.events[0].event_type, ChangeKind::Update);
        assert_eq!(written.events[0].new.as_ref(), Some(&written.value));
        assert!(written.value.revision > created.value.revision);
    }

    #[tokio::test]
    async fn deactivating_a_category_emits_one_event_per_changed_row() {
        let (ctx, category) = setup().await;
        let first = create_item(&ctx, category, "v1").await.expect("item");
        create_item(&ctx, category, "v2").await.expect("item");
        set_active(&ctx, first.value.id, true).await.expect("write");

        let cleared = deactivate_category(&ctx, category)
            .await
            .expect("deactivate");
        assert_eq!(cleared.events.len(), 1);
        assert_eq!(cleared.events[0].item_id(), Some(first.value.id));
        assert!(cleared.value.iter().all(|item| !item.active));
    }

    #[tokio::test]
    async fn delete_emits_event_carrying_the_old_row() {
        let (ctx, category) = setup().await;
        let item = create_item(&ctx, category, "v1").await.expect("item");
        let deleted = delete_item(&ctx, item.value.id).await.expect("delete");
        assert_eq!(deleted.events[0].event_type, ChangeKind::Delete);
        assert_eq!(deleted.events[0].category_id(), Some(category));

        let err = delete_item(&ctx, item.value.id)
            .await
            .expect_err("already deleted");
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
