use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

/// Read-only product lookup. The checkout core never mutates the catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_product(&self, product_id: Uuid) -> Result<Option<product::Model>, ServiceError>;

    async fn list_by_category(&self, category: &str) -> Result<Vec<product::Model>, ServiceError>;
}

/// Catalog backed by the `products` table.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts a product. Used for seeding; catalog administration lives elsewhere.
    pub async fn insert(&self, product: product::Model) -> Result<product::Model, ServiceError> {
        let model = product::ActiveModel {
            id: Set(product.id),
            name: Set(product.name),
            category: Set(product.category),
            price_minor: Set(product.price_minor),
            stock: Set(product.stock),
            active: Set(product.active),
            image_url: Set(product.image_url),
            created_at: Set(product.created_at),
        };
        Ok(model.insert(&*self.db).await?)
    }
}

#[async_trait]
impl Catalog for DbCatalog {
    async fn get_product(&self, product_id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        Ok(ProductEntity::find_by_id(product_id).one(&*self.db).await?)
    }

    async fn list_by_category(&self, category: &str) -> Result<Vec<product::Model>, ServiceError> {
        Ok(ProductEntity::find()
            .filter(product::Column::Category.eq(category))
            .filter(product::Column::Active.eq(true))
            .order_by_asc(product::Column::Name)
            .all(&*self.db)
            .await?)
    }
}
