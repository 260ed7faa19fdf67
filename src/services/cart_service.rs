use crate::{
    entities::{cart, cart_item},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{catalog::Catalog, keyed_lock::KeyedLocks},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Point-in-time view of a cart and its lines.
#[derive(Debug, Clone, Serialize)]
pub struct CartSnapshot {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

impl CartSnapshot {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Exact sum of `unit_price × quantity` over all lines.
    pub fn total(&self) -> Decimal {
        self.items.iter().map(cart_item::Model::subtotal).sum()
    }

    pub fn item(&self, product_id: Uuid) -> Option<&cart_item::Model> {
        self.items.iter().find(|i| i.product_id == product_id)
    }
}

/// Cart Store.
///
/// Every mutation for a user runs under that user's entry in the shared
/// [`KeyedLocks`], so concurrent adds/adjusts/removes for one user apply one at
/// a time and never lose a quantity update. Different users never contend.
///
/// The same lock registry is held by the conversation engine while it
/// processes a checkout event, so a cart cannot change underneath an order
/// being created from it.
///
/// Reads (`get_active_cart`) do not take the lock; they observe the last
/// committed state.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    user_locks: KeyedLocks<i64>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    /// Creates a new `CartService`.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `catalog` - Product lookup used for availability and price snapshots
    /// * `user_locks` - Per-user lock registry shared with the conversation engine
    /// * `event_sender` - Event sender for publishing cart events
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        user_locks: KeyedLocks<i64>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            user_locks,
            event_sender,
        }
    }

    /// Adds `quantity` of a product to the user's active cart.
    ///
    /// Creates an active cart first when the user has none. When the product is
    /// already in the cart its quantity grows and the original price snapshot is
    /// kept; otherwise a new line captures the catalog price at this moment.
    ///
    /// # Errors
    ///
    /// * `ValidationError` - `quantity` is less than 1
    /// * `ProductUnavailable` - the product does not exist or is inactive
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: i64,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartSnapshot, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let _guard = self.user_locks.lock(user_id).await;

        let product = self
            .catalog
            .get_product(product_id)
            .await?
            .filter(|p| p.active)
            .ok_or(ServiceError::ProductUnavailable(product_id))?;

        let txn = self.db.begin().await?;
        let cart = match find_active_cart(&txn, user_id).await? {
            Some(cart) => cart,
            None => create_cart(&txn, user_id).await?,
        };

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item.quantity.saturating_add(quantity);
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(new_quantity);
                active.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    product_name: Set(product.name.clone()),
                    quantity: Set(quantity),
                    unit_price_minor: Set(product.price_minor),
                    created_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await?;
            }
        }
        touch_cart(&txn, cart.id).await?;
        let snapshot = load_snapshot(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                user_id,
                cart_id: snapshot.cart.id,
                product_id,
                quantity,
            })
            .await;

        info!(user_id, %product_id, quantity, "Added item to cart");
        Ok(snapshot)
    }

    /// Changes a line's quantity by `delta`.
    ///
    /// A result of zero or less removes the line. Adjusting a product that is not
    /// in the cart, or a user without an active cart, is a no-op.
    #[instrument(skip(self))]
    pub async fn adjust_qty(
        &self,
        user_id: i64,
        product_id: Uuid,
        delta: i32,
    ) -> Result<Option<CartSnapshot>, ServiceError> {
        let _guard = self.user_locks.lock(user_id).await;

        let txn = self.db.begin().await?;
        let Some(cart) = find_active_cart(&txn, user_id).await? else {
            return Ok(None);
        };

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        let mut removed = false;
        if let Some(item) = existing {
            let new_quantity = item.quantity.saturating_add(delta);
            if new_quantity <= 0 {
                cart_item::Entity::delete_by_id(item.id).exec(&txn).await?;
                removed = true;
            } else {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(new_quantity);
                active.update(&txn).await?;
            }
            touch_cart(&txn, cart.id).await?;
        } else {
            debug!(user_id, %product_id, "Adjust on product not in cart ignored");
        }

        let snapshot = load_snapshot(&txn, cart).await?;
        txn.commit().await?;

        if removed {
            self.event_sender
                .send_or_log(Event::CartItemRemoved {
                    user_id,
                    cart_id: snapshot.cart.id,
                    product_id,
                })
                .await;
        }

        Ok(Some(snapshot))
    }

    /// Removes a product line. Removing an absent line is a no-op.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: i64,
        product_id: Uuid,
    ) -> Result<Option<CartSnapshot>, ServiceError> {
        let _guard = self.user_locks.lock(user_id).await;

        let txn = self.db.begin().await?;
        let Some(cart) = find_active_cart(&txn, user_id).await? else {
            return Ok(None);
        };

        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;
        if result.rows_affected > 0 {
            touch_cart(&txn, cart.id).await?;
        }

        let snapshot = load_snapshot(&txn, cart).await?;
        txn.commit().await?;

        if result.rows_affected > 0 {
            self.event_sender
                .send_or_log(Event::CartItemRemoved {
                    user_id,
                    cart_id: snapshot.cart.id,
                    product_id,
                })
                .await;
        }

        Ok(Some(snapshot))
    }

    /// Returns the user's active cart, if any.
    pub async fn get_active_cart(&self, user_id: i64) -> Result<Option<CartSnapshot>, ServiceError> {
        let Some(cart) = find_active_cart(&*self.db, user_id).await? else {
            return Ok(None);
        };
        Ok(Some(load_snapshot(&*self.db, cart).await?))
    }

    /// Marks a cart inactive. Returns `false` when it was already inactive.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, cart_id: Uuid) -> Result<bool, ServiceError> {
        let changed = deactivate_cart(&*self.db, cart_id).await?;
        if changed {
            self.event_sender
                .send_or_log(Event::CartDeactivated(cart_id))
                .await;
        }
        Ok(changed)
    }
}

/// Compare-and-set `active = false`. Usable inside a caller's transaction.
pub(crate) async fn deactivate_cart<C>(conn: &C, cart_id: Uuid) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let result = cart::Entity::update_many()
        .col_expr(cart::Column::Active, false.into())
        .col_expr(cart::Column::UpdatedAt, Utc::now().into())
        .filter(cart::Column::Id.eq(cart_id))
        .filter(cart::Column::Active.eq(true))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Gives a deactivated cart back to its user. Usable inside a caller's
/// transaction.
///
/// When the user has opened another active cart since, the old lines move into
/// that cart instead; a product present in both keeps the newer line and its
/// price snapshot, with the quantities summed. Returns the id of the cart that
/// is active afterwards.
pub(crate) async fn restore_cart<C>(
    conn: &C,
    user_id: i64,
    cart_id: Uuid,
) -> Result<Uuid, ServiceError>
where
    C: ConnectionTrait,
{
    let Some(current) = find_active_cart(conn, user_id).await? else {
        cart::Entity::update_many()
            .col_expr(cart::Column::Active, true.into())
            .col_expr(cart::Column::UpdatedAt, Utc::now().into())
            .filter(cart::Column::Id.eq(cart_id))
            .filter(cart::Column::UserId.eq(user_id))
            .exec(conn)
            .await?;
        return Ok(cart_id);
    };
    if current.id == cart_id {
        return Ok(cart_id);
    }

    let old_items = cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .all(conn)
        .await?;
    for item in old_items {
        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(current.id))
            .filter(cart_item::Column::ProductId.eq(item.product_id))
            .one(conn)
            .await?;
        match existing {
            Some(line) => {
                let quantity = line.quantity.saturating_add(item.quantity);
                let mut merged: cart_item::ActiveModel = line.into();
                merged.quantity = Set(quantity);
                merged.update(conn).await?;
                cart_item::Entity::delete_by_id(item.id).exec(conn).await?;
            }
            None => {
                let mut moved: cart_item::ActiveModel = item.into();
                moved.cart_id = Set(current.id);
                moved.update(conn).await?;
            }
        }
    }
    touch_cart(conn, current.id).await?;
    debug!(user_id, from = %cart_id, into = %current.id, "Merged restored cart lines");
    Ok(current.id)
}

async fn find_active_cart<C>(conn: &C, user_id: i64) -> Result<Option<cart::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(cart::Entity::find()
        .filter(cart::Column::UserId.eq(user_id))
        .filter(cart::Column::Active.eq(true))
        .order_by_desc(cart::Column::CreatedAt)
        .one(conn)
        .await?)
}

async fn create_cart<C>(conn: &C, user_id: i64) -> Result<cart::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    debug!(user_id, cart_id = %cart.id, "Created cart");
    Ok(cart)
}

async fn touch_cart<C>(conn: &C, cart_id: Uuid) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    cart::Entity::update_many()
        .col_expr(cart::Column::UpdatedAt, Utc::now().into())
        .filter(cart::Column::Id.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(())
}

async fn load_snapshot<C>(conn: &C, cart: cart::Model) -> Result<CartSnapshot, ServiceError>
where
    C: ConnectionTrait,
{
    let items = cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(CartSnapshot { cart, items })
}
