use crate::{
    checkout::{engine, CheckoutEngine, CheckoutInput},
    errors::ServiceError,
    services::{
        cart_service::{CartService, CartSnapshot},
        catalog::Catalog,
    },
    transport::{Button, ChatTransport, InboundEvent, InboundHandler, InboundKind, OutboundMessage},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

pub const ACTION_CHECKOUT: &str = "checkout";
pub const ACTION_VIEW_CART: &str = "cart";

/// How a reply reaches the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Send(OutboundMessage),
    /// Replace the message that carried the pressed button.
    Edit(i64, OutboundMessage),
}

impl Reply {
    pub fn message(&self) -> &OutboundMessage {
        match self {
            Reply::Send(message) | Reply::Edit(_, message) => message,
        }
    }
}

/// Routes inbound chat events to the Cart Store and the Conversation Engine.
#[derive(Clone)]
pub struct ChatRouter {
    carts: CartService,
    catalog: Arc<dyn Catalog>,
    engine: CheckoutEngine,
    transport: Arc<dyn ChatTransport>,
}

impl ChatRouter {
    pub fn new(
        carts: CartService,
        catalog: Arc<dyn Catalog>,
        engine: CheckoutEngine,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            carts,
            catalog,
            engine,
            transport,
        }
    }

    /// Computes the replies for one event without sending them.
    #[instrument(skip(self, event), fields(user_id = event.user_id, kind = ?event.kind))]
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<Vec<Reply>, ServiceError> {
        match event.kind {
            InboundKind::Command => self.command(event.user_id, &event.payload).await,
            InboundKind::ButtonPress => {
                self.button(event.user_id, &event.payload, event.message_id)
                    .await
            }
            InboundKind::Text => {
                let input = CheckoutInput::Text(event.payload.clone());
                Ok(match self.engine.handle(event.user_id, input).await? {
                    Some(messages) => sends(messages),
                    None => vec![Reply::Send(OutboundMessage::text(
                        "Send /cart to see your cart or /checkout to place an order.",
                    ))],
                })
            }
        }
    }

    async fn command(&self, user_id: i64, payload: &str) -> Result<Vec<Reply>, ServiceError> {
        let (name, argument) = payload.split_once(' ').unwrap_or((payload, ""));
        let argument = argument.trim();

        match name {
            "start" => Ok(vec![Reply::Send(OutboundMessage::text(
                "Welcome! Use /shop <category> to browse products, /cart to view your cart and /checkout to place an order.",
            ))]),
            "shop" => self.shop(argument).await,
            "cart" => Ok(vec![Reply::Send(self.cart_view(user_id).await?)]),
            "checkout" => Ok(sends(self.engine.start(user_id).await?)),
            "cancel" => self.checkout_input(user_id, CheckoutInput::Abort).await,
            "skip" => self.checkout_input(user_id, CheckoutInput::SkipEmail).await,
            other => {
                debug!(command = other, "Unknown command");
                Ok(vec![Reply::Send(OutboundMessage::text(
                    "Unknown command. Try /start.",
                ))])
            }
        }
    }

    async fn button(
        &self,
        user_id: i64,
        action: &str,
        message_id: Option<i64>,
    ) -> Result<Vec<Reply>, ServiceError> {
        match action {
            ACTION_CHECKOUT => return Ok(sends(self.engine.start(user_id).await?)),
            ACTION_VIEW_CART => return Ok(vec![Reply::Send(self.cart_view(user_id).await?)]),
            engine::ACTION_CONFIRM => {
                return self.checkout_input(user_id, CheckoutInput::Confirm).await
            }
            engine::ACTION_CANCEL => {
                return self.checkout_input(user_id, CheckoutInput::Cancel).await
            }
            _ => {}
        }

        let Some((verb, product)) = action.split_once(':') else {
            debug!(action, "Unknown button action");
            return Ok(Vec::new());
        };
        let Ok(product_id) = Uuid::parse_str(product) else {
            debug!(action, "Button action carries no product id");
            return Ok(Vec::new());
        };

        match verb {
            "add" => {
                let snapshot = self.carts.add_item(user_id, product_id, 1).await?;
                let name = snapshot
                    .item(product_id)
                    .map(|i| i.product_name.clone())
                    .unwrap_or_else(|| "Item".to_string());
                Ok(vec![Reply::Send(
                    OutboundMessage::text(format!("{} added to your cart.", name))
                        .with_row(vec![Button::new("View cart", ACTION_VIEW_CART)]),
                )])
            }
            "inc" | "dec" | "rm" => {
                let snapshot = match verb {
                    "inc" => self.carts.adjust_qty(user_id, product_id, 1).await?,
                    "dec" => self.carts.adjust_qty(user_id, product_id, -1).await?,
                    _ => self.carts.remove_item(user_id, product_id).await?,
                };
                let view = render_cart(snapshot.as_ref());
                Ok(vec![match message_id {
                    Some(message_id) => Reply::Edit(message_id, view),
                    None => Reply::Send(view),
                }])
            }
            _ => {
                debug!(action, "Unknown button action");
                Ok(Vec::new())
            }
        }
    }

    async fn checkout_input(
        &self,
        user_id: i64,
        input: CheckoutInput,
    ) -> Result<Vec<Reply>, ServiceError> {
        Ok(match self.engine.handle(user_id, input).await? {
            Some(messages) => sends(messages),
            None => vec![Reply::Send(OutboundMessage::text(
                "There is no checkout in progress. Use /checkout to start one.",
            ))],
        })
    }

    async fn shop(&self, category: &str) -> Result<Vec<Reply>, ServiceError> {
        if category.is_empty() {
            return Ok(vec![Reply::Send(OutboundMessage::text(
                "Usage: /shop <category>",
            ))]);
        }
        let products = self.catalog.list_by_category(category).await?;
        if products.is_empty() {
            return Ok(vec![Reply::Send(OutboundMessage::text(format!(
                "No products found in {}.",
                category
            )))]);
        }
        let message = products.iter().fold(
            OutboundMessage::text(format!("Products in {}:", category)),
            |message, product| {
                message.with_row(vec![Button::new(
                    format!("{} - {}", product.name, product.price()),
                    format!("add:{}", product.id),
                )])
            },
        );
        Ok(vec![Reply::Send(message)])
    }

    async fn cart_view(&self, user_id: i64) -> Result<OutboundMessage, ServiceError> {
        let snapshot = self.carts.get_active_cart(user_id).await?;
        Ok(render_cart(snapshot.as_ref()))
    }

    async fn deliver(&self, user_id: i64, reply: &Reply) {
        let result = match reply {
            Reply::Send(message) => self.transport.send_text(user_id, message).await,
            Reply::Edit(message_id, message) => {
                self.transport
                    .edit_message(user_id, *message_id, message)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(user_id, "Reply could not be delivered: {}", e);
        }
    }
}

#[async_trait]
impl InboundHandler for ChatRouter {
    async fn handle_event(&self, event: InboundEvent) {
        let replies = match self.dispatch(&event).await {
            Ok(replies) => replies,
            Err(e) => vec![Reply::Send(error_message(&e))],
        };
        for reply in &replies {
            self.deliver(event.user_id, reply).await;
        }
    }
}

fn sends(messages: Vec<OutboundMessage>) -> Vec<Reply> {
    messages.into_iter().map(Reply::Send).collect()
}

fn error_message(error: &ServiceError) -> OutboundMessage {
    match error {
        ServiceError::ProductUnavailable(_) => {
            OutboundMessage::text("That product is no longer available.")
        }
        ServiceError::ValidationError(message) => OutboundMessage::text(message.clone()),
        other => {
            error!("Chat event failed: {}", other);
            OutboundMessage::text("Something went wrong. Please try again.")
        }
    }
}

/// Cart view: one `name xQty = subtotal` line per item with +/-/remove
/// buttons, the total, and a Checkout button.
pub fn render_cart(snapshot: Option<&CartSnapshot>) -> OutboundMessage {
    let Some(snapshot) = snapshot.filter(|s| !s.is_empty()) else {
        return OutboundMessage::text("Your cart is empty.");
    };

    let mut text = String::from("Your cart:\n\n");
    for item in &snapshot.items {
        text.push_str(&format!(
            "{} x{} = {}\n",
            item.product_name,
            item.quantity,
            item.subtotal()
        ));
    }
    text.push_str(&format!("\nTotal: {}", snapshot.total()));

    let mut message = OutboundMessage::text(text);
    for item in &snapshot.items {
        message = message.with_row(vec![
            Button::new("+", format!("inc:{}", item.product_id)),
            Button::new("-", format!("dec:{}", item.product_id)),
            Button::new(
                format!("Remove {}", item.product_name),
                format!("rm:{}", item.product_id),
            ),
        ]);
    }
    message.with_row(vec![Button::new("Checkout", ACTION_CHECKOUT)])
}
