use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money,
    notifications::Notifier,
    services::{
        cart_service::{deactivate_cart, restore_cart, CartSnapshot},
        catalog::Catalog,
    },
    transport::OutboundMessage,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Condition, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Customer fields copied onto the order at confirmation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerFields {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failure,
    Cancelled,
}

impl PaymentOutcome {
    pub fn target_status(self) -> OrderStatus {
        match self {
            PaymentOutcome::Success => OrderStatus::Paid,
            PaymentOutcome::Failure | PaymentOutcome::Cancelled => OrderStatus::Cancelled,
        }
    }
}

/// An order with its lines.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub lines: Vec<order_item::Model>,
}

impl OrderDetails {
    pub fn total(&self) -> Decimal {
        self.order.total()
    }
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub details: OrderDetails,
    /// Names of cart lines skipped because the product vanished or went inactive.
    pub dropped_products: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub order_id: Uuid,
    pub applied: bool,
    pub status: OrderStatus,
}

struct PricedLine {
    product_id: Uuid,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
}

/// Order Ledger: atomic order creation and exactly-once payment resolution.
#[derive(Clone)]
pub struct OrderLedger {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    notifier: Notifier,
    event_sender: Arc<EventSender>,
}

impl OrderLedger {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        notifier: Notifier,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            notifier,
            event_sender,
        }
    }

    /// Creates a PENDING order from a cart snapshot and deactivates the cart.
    ///
    /// Lines whose product no longer exists or is inactive are skipped and
    /// reported in [`CreatedOrder::dropped_products`]. Either the order, all of
    /// its lines and the cart deactivation commit together, or nothing does.
    ///
    /// # Errors
    ///
    /// * `EmptyCart` - the snapshot has no lines, or none survive the catalog check
    /// * `InsufficientStock` - a line asks for more than the product's recorded stock
    /// * `Conflict` - the cart was already converted into an order
    #[instrument(skip(self, fields, snapshot), fields(cart_id = %snapshot.cart.id))]
    pub async fn create_order(
        &self,
        user_id: i64,
        fields: &CustomerFields,
        snapshot: &CartSnapshot,
    ) -> Result<CreatedOrder, ServiceError> {
        if snapshot.cart.user_id != user_id {
            return Err(ServiceError::InvalidOperation(
                "Cart does not belong to this user".to_string(),
            ));
        }
        if snapshot.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        // Catalog reads happen before the transaction opens.
        let mut lines = Vec::with_capacity(snapshot.items.len());
        let mut dropped_products = Vec::new();
        for item in &snapshot.items {
            match self.catalog.get_product(item.product_id).await? {
                Some(product) if product.active => {
                    if item.quantity > product.stock {
                        return Err(ServiceError::InsufficientStock {
                            product_id: product.id,
                            requested: item.quantity,
                            available: product.stock,
                        });
                    }
                    lines.push(PricedLine {
                        product_id: item.product_id,
                        product_name: item.product_name.clone(),
                        quantity: item.quantity,
                        unit_price: item.unit_price(),
                    });
                }
                _ => {
                    warn!(product_id = %item.product_id, "Dropping unavailable product from order");
                    dropped_products.push(item.product_name.clone());
                }
            }
        }
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let total: Decimal = lines
            .iter()
            .map(|l| money::line_subtotal(l.unit_price, l.quantity))
            .sum();
        let total_minor = money::to_minor(total)?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let txn = self.db.begin().await?;

        if !deactivate_cart(&txn, snapshot.cart.id).await? {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Cart is no longer active".to_string(),
            ));
        }

        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            cart_id: Set(snapshot.cart.id),
            customer_name: Set(fields.name.clone()),
            customer_phone: Set(fields.phone.clone()),
            shipping_address: Set(fields.address.clone()),
            customer_email: Set(fields.email.clone()),
            total_minor: Set(total_minor),
            status: Set(OrderStatus::Pending),
            payment_session_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            resolved_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut saved_lines = Vec::with_capacity(lines.len());
        for line in lines {
            let unit_price_minor = money::to_minor(line.unit_price)?;
            let subtotal_minor =
                money::to_minor(money::line_subtotal(line.unit_price, line.quantity))?;
            let saved = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_price_minor: Set(unit_price_minor),
                subtotal_minor: Set(subtotal_minor),
            }
            .insert(&txn)
            .await?;
            saved_lines.push(saved);
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartDeactivated(snapshot.cart.id))
            .await;
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                user_id,
                total,
            })
            .await;

        info!(%order_id, user_id, %total, lines = saved_lines.len(), "Order created");

        Ok(CreatedOrder {
            details: OrderDetails {
                order,
                lines: saved_lines,
            },
            dropped_products,
        })
    }

    /// Moves a PENDING order to its terminal status, at most once.
    ///
    /// The transition is a single conditional UPDATE keyed on the order still
    /// being PENDING and the session id being unset or equal to the supplied
    /// one. Whoever changes the row wins and triggers notifications; every
    /// later or concurrent attempt sees `applied = false`.
    ///
    /// # Errors
    ///
    /// * `NotFound` - no such order
    /// * `Conflict` - the order is PENDING but bound to a different session
    #[instrument(skip(self))]
    pub async fn resolve_payment(
        &self,
        order_id: Uuid,
        outcome: PaymentOutcome,
        external_session_id: Option<&str>,
    ) -> Result<Resolution, ServiceError> {
        let target = outcome.target_status();
        let now = Utc::now();

        let mut update = order::Entity::update_many()
            .col_expr(order::Column::Status, target.into())
            .col_expr(order::Column::UpdatedAt, now.into())
            .col_expr(order::Column::ResolvedAt, Some(now).into())
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending));

        if let Some(session_id) = external_session_id {
            update = update
                .col_expr(order::Column::PaymentSessionId, session_id.into())
                .filter(
                    Condition::any()
                        .add(order::Column::PaymentSessionId.is_null())
                        .add(order::Column::PaymentSessionId.eq(session_id)),
                );
        }

        let result = update.exec(&*self.db).await?;

        if result.rows_affected == 0 {
            let current = order::Entity::find_by_id(order_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {}", order_id)))?;

            if current.status.is_terminal() {
                debug!(%order_id, status = %current.status, "Order already resolved; ignoring");
                return Ok(Resolution {
                    order_id,
                    applied: false,
                    status: current.status,
                });
            }

            warn!(
                %order_id,
                bound = ?current.payment_session_id,
                supplied = ?external_session_id,
                "Payment session mismatch"
            );
            return Err(ServiceError::Conflict(format!(
                "Order {} is bound to a different payment session",
                order_id
            )));
        }

        info!(%order_id, status = %target, ?outcome, "Order resolved");

        self.event_sender
            .send_or_log(match target {
                OrderStatus::Paid => Event::OrderPaid(order_id),
                _ => Event::OrderCancelled(order_id),
            })
            .await;

        match self.get_order(order_id).await {
            Ok(details) => self.announce(&details, outcome),
            Err(e) => warn!(%order_id, "Resolved order could not be reloaded for notification: {}", e),
        }

        Ok(Resolution {
            order_id,
            applied: true,
            status: target,
        })
    }

    /// Cancels a PENDING order that never got a payment session and gives its
    /// cart back to the user. Both happen in one transaction.
    ///
    /// Returns `applied = false` when the order was already resolved.
    ///
    /// # Errors
    ///
    /// * `NotFound` - no such order
    /// * `Conflict` - the order is bound to a payment session, so only the
    ///   processor's outcome may resolve it
    #[instrument(skip(self))]
    pub async fn abandon_order(&self, order_id: Uuid) -> Result<Resolution, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let Some(order) = order::Entity::find_by_id(order_id).one(&txn).await? else {
            txn.rollback().await?;
            return Err(ServiceError::NotFound(format!("Order {}", order_id)));
        };

        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, OrderStatus::Cancelled.into())
            .col_expr(order::Column::UpdatedAt, now.into())
            .col_expr(order::Column::ResolvedAt, Some(now).into())
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PaymentSessionId.is_null())
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            let current = order::Entity::find_by_id(order_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {}", order_id)))?;
            if current.status.is_terminal() {
                debug!(%order_id, status = %current.status, "Order already resolved; nothing to abandon");
                return Ok(Resolution {
                    order_id,
                    applied: false,
                    status: current.status,
                });
            }
            return Err(ServiceError::Conflict(format!(
                "Order {} is bound to a payment session",
                order_id
            )));
        }

        let cart_id = restore_cart(&txn, order.user_id, order.cart_id).await?;
        txn.commit().await?;

        info!(%order_id, user_id = order.user_id, %cart_id, "Unpaid order abandoned; cart restored");

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;
        self.event_sender
            .send_or_log(Event::CartRestored {
                user_id: order.user_id,
                cart_id,
            })
            .await;

        match self.get_order(order_id).await {
            Ok(details) => self.announce(&details, PaymentOutcome::Cancelled),
            Err(e) => warn!(%order_id, "Abandoned order could not be reloaded for notification: {}", e),
        }

        Ok(Resolution {
            order_id,
            applied: true,
            status: OrderStatus::Cancelled,
        })
    }

    /// Binds the processor's session id to a PENDING order that has none yet.
    /// Returns `false` when the order was already bound or resolved.
    #[instrument(skip(self))]
    pub async fn attach_payment_session(
        &self,
        order_id: Uuid,
        session_id: &str,
    ) -> Result<bool, ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::PaymentSessionId, session_id.into())
            .col_expr(order::Column::UpdatedAt, Utc::now().into())
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PaymentSessionId.is_null())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {}", order_id)))?;
        let lines = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::ProductName)
            .all(&*self.db)
            .await?;
        Ok(OrderDetails { order, lines })
    }

    /// PENDING orders bound to a payment session and created before `cutoff`.
    pub async fn pending_with_session(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PaymentSessionId.is_not_null())
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    fn announce(&self, details: &OrderDetails, outcome: PaymentOutcome) {
        let order = &details.order;
        let reference = short_ref(order.id);
        let text = match outcome {
            PaymentOutcome::Success => format!(
                "Payment received for order #{}. Total: {}. Thank you!",
                reference,
                order.total()
            ),
            PaymentOutcome::Failure => format!(
                "Payment for order #{} failed. The order has been cancelled.",
                reference
            ),
            PaymentOutcome::Cancelled => {
                format!("Order #{} has been cancelled.", reference)
            }
        };
        self.notifier.notify(order.user_id, OutboundMessage::text(text));

        if outcome == PaymentOutcome::Success {
            self.notifier
                .notify_merchant(OutboundMessage::text(merchant_summary(details)));
        }
    }
}

pub fn short_ref(order_id: Uuid) -> String {
    order_id.simple().to_string()[..8].to_uppercase()
}

fn merchant_summary(details: &OrderDetails) -> String {
    let order = &details.order;
    let mut text = format!(
        "New paid order #{}\nCustomer: {}\nPhone: {}\nAddress: {}\n",
        short_ref(order.id),
        order.customer_name,
        order.customer_phone,
        order.shipping_address
    );
    if let Some(email) = &order.customer_email {
        text.push_str(&format!("Email: {}\n", email));
    }
    for line in &details.lines {
        text.push_str(&format!(
            "- {} x{} = {}\n",
            line.product_name,
            line.quantity,
            line.subtotal()
        ));
    }
    text.push_str(&format!("Total: {}", order.total()));
    text
}
