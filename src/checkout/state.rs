//! Checkout dialogue as a pure state machine.
//!
//! [`Dialogue::apply`] maps `(state, fields, input)` to the next state plus one
//! [`Effect`] describing what the caller should do. Nothing here performs I/O.

use super::validation::{
    validate_address, validate_email, validate_name, validate_phone, Field, FieldError,
};
use crate::services::order_ledger::CustomerFields;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    CollectingName,
    CollectingPhone,
    CollectingAddress,
    CollectingEmail,
    AwaitingConfirmation,
    Terminated(Termination),
}

impl CheckoutState {
    pub fn is_terminated(self) -> bool {
        matches!(self, CheckoutState::Terminated(_))
    }

    fn awaited_field(self) -> Option<Field> {
        match self {
            CheckoutState::CollectingName => Some(Field::Name),
            CheckoutState::CollectingPhone => Some(Field::Phone),
            CheckoutState::CollectingAddress => Some(Field::Address),
            CheckoutState::CollectingEmail => Some(Field::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Confirmed,
    Cancelled(CancelReason),
    EmptyCart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Cancel button.
    UserCancelled,
    /// `/cancel` command.
    Aborted,
    IdleTimeout,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::UserCancelled => "user_cancelled",
            CancelReason::Aborted => "aborted",
            CancelReason::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutInput {
    Text(String),
    SkipEmail,
    Confirm,
    Cancel,
    Abort,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask for a field.
    Prompt(Field),
    /// Tell the user why their input was rejected; the state did not move.
    Reprompt(FieldError),
    /// Show the collected fields with confirm/cancel buttons.
    RenderSummary,
    /// Create the order. The state stays at confirmation until the caller
    /// reports success through [`Dialogue::confirmed`].
    CreateOrder,
    Cancelled(CancelReason),
    EmptyCart,
    /// Input arrived after termination.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectedFields {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub email: Option<String>,
}

impl CollectedFields {
    /// Complete customer fields, once name, phone and address are all present.
    pub fn to_customer_fields(&self) -> Option<CustomerFields> {
        Some(CustomerFields {
            name: self.name.clone()?,
            phone: self.phone.clone()?,
            address: self.address.clone()?,
            email: self.email.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialogue {
    pub state: CheckoutState,
    pub fields: CollectedFields,
}

impl Dialogue {
    /// Starts a dialogue. An empty cart terminates immediately.
    pub fn enter(cart_is_empty: bool) -> (Self, Effect) {
        if cart_is_empty {
            return (
                Self {
                    state: CheckoutState::Terminated(Termination::EmptyCart),
                    fields: CollectedFields::default(),
                },
                Effect::EmptyCart,
            );
        }
        (
            Self {
                state: CheckoutState::CollectingName,
                fields: CollectedFields::default(),
            },
            Effect::Prompt(Field::Name),
        )
    }

    pub fn apply(self, input: CheckoutInput) -> (Self, Effect) {
        use CheckoutInput as In;
        use CheckoutState as S;

        let Dialogue { state, mut fields } = self;

        if state.is_terminated() {
            return (Dialogue { state, fields }, Effect::Ignored);
        }

        let cancel = |reason: CancelReason, fields: CollectedFields| {
            (
                Dialogue {
                    state: S::Terminated(Termination::Cancelled(reason)),
                    fields,
                },
                Effect::Cancelled(reason),
            )
        };

        match (state, input) {
            (_, In::Cancel) => cancel(CancelReason::UserCancelled, fields),
            (_, In::Abort) => cancel(CancelReason::Aborted, fields),
            (_, In::Timeout) => cancel(CancelReason::IdleTimeout, fields),

            (S::CollectingName, In::Text(text)) => {
                advance(state, fields, validate_name(&text), S::CollectingPhone, |f, v| {
                    f.name = Some(v)
                })
            }
            (S::CollectingPhone, In::Text(text)) => {
                advance(state, fields, validate_phone(&text), S::CollectingAddress, |f, v| {
                    f.phone = Some(v)
                })
            }
            (S::CollectingAddress, In::Text(text)) => advance(
                state,
                fields,
                validate_address(&text),
                S::CollectingEmail,
                |f, v| f.address = Some(v),
            ),
            (S::CollectingEmail, In::Text(text)) => match validate_email(&text) {
                Ok(email) => {
                    fields.email = Some(email);
                    summary(fields)
                }
                Err(e) => (Dialogue { state, fields }, Effect::Reprompt(e)),
            },
            (S::CollectingEmail, In::SkipEmail) => {
                fields.email = None;
                summary(fields)
            }

            (S::AwaitingConfirmation, In::Confirm) => (Dialogue { state, fields }, Effect::CreateOrder),
            (S::AwaitingConfirmation, _) => (Dialogue { state, fields }, Effect::RenderSummary),

            // Out-of-place skip/confirm while a field is pending: ask again.
            (state, _) => {
                let effect = match state.awaited_field() {
                    Some(field) => Effect::Prompt(field),
                    None => Effect::Ignored,
                };
                (Dialogue { state, fields }, effect)
            }
        }
    }

    /// Marks the dialogue finished after the order was created.
    pub fn confirmed(self) -> Self {
        Dialogue {
            state: CheckoutState::Terminated(Termination::Confirmed),
            fields: self.fields,
        }
    }
}

fn advance(
    state: CheckoutState,
    mut fields: CollectedFields,
    validated: Result<String, FieldError>,
    next: CheckoutState,
    store: impl FnOnce(&mut CollectedFields, String),
) -> (Dialogue, Effect) {
    match validated {
        Ok(value) => {
            store(&mut fields, value);
            let effect = match next.awaited_field() {
                Some(field) => Effect::Prompt(field),
                None => Effect::RenderSummary,
            };
            (Dialogue { state: next, fields }, effect)
        }
        Err(e) => (Dialogue { state, fields }, Effect::Reprompt(e)),
    }
}

fn summary(fields: CollectedFields) -> (Dialogue, Effect) {
    (
        Dialogue {
            state: CheckoutState::AwaitingConfirmation,
            fields,
        },
        Effect::RenderSummary,
    )
}

/// The question asked when a field is awaited.
pub fn question(field: Field) -> &'static str {
    match field {
        Field::Name => "Please enter your full name:",
        Field::Phone => "Please enter your phone number:",
        Field::Address => "Please enter your delivery address:",
        Field::Email => "(Optional) Enter your email or send /skip:",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CheckoutInput {
        CheckoutInput::Text(s.to_string())
    }

    fn run(inputs: Vec<CheckoutInput>) -> (Dialogue, Effect) {
        let (mut dialogue, mut effect) = Dialogue::enter(false);
        for input in inputs {
            let (d, e) = dialogue.apply(input);
            dialogue = d;
            effect = e;
        }
        (dialogue, effect)
    }

    #[test]
    fn empty_cart_terminates_on_entry() {
        let (dialogue, effect) = Dialogue::enter(true);
        assert_eq!(dialogue.state, CheckoutState::Terminated(Termination::EmptyCart));
        assert_eq!(effect, Effect::EmptyCart);
    }

    #[test]
    fn happy_path_reaches_confirmation() {
        let (dialogue, effect) = run(vec![
            text("Ada Lovelace"),
            text("+1234567"),
            text("12 Analytical Row"),
            text("ada@example.com"),
        ]);
        assert_eq!(dialogue.state, CheckoutState::AwaitingConfirmation);
        assert_eq!(effect, Effect::RenderSummary);
        let fields = dialogue.fields.to_customer_fields().unwrap();
        assert_eq!(fields.email.as_deref(), Some("ada@example.com"));

        let (dialogue, effect) = dialogue.apply(CheckoutInput::Confirm);
        assert_eq!(effect, Effect::CreateOrder);
        assert_eq!(dialogue.state, CheckoutState::AwaitingConfirmation);
        assert_eq!(
            dialogue.confirmed().state,
            CheckoutState::Terminated(Termination::Confirmed)
        );
    }

    #[test]
    fn invalid_phone_reprompts_then_advances() {
        let (dialogue, effect) = run(vec![text("Ada"), text("abc")]);
        assert_eq!(dialogue.state, CheckoutState::CollectingPhone);
        assert!(matches!(effect, Effect::Reprompt(FieldError { field: Field::Phone, .. })));

        let (dialogue, effect) = dialogue.apply(text("+1234567"));
        assert_eq!(dialogue.state, CheckoutState::CollectingAddress);
        assert_eq!(effect, Effect::Prompt(Field::Address));
    }

    #[test]
    fn email_can_be_skipped() {
        let (dialogue, _) = run(vec![
            text("Ada"),
            text("1234567"),
            text("Main street 1"),
            CheckoutInput::SkipEmail,
        ]);
        assert_eq!(dialogue.state, CheckoutState::AwaitingConfirmation);
        assert_eq!(dialogue.fields.email, None);
    }

    #[test]
    fn cancel_abort_and_timeout_terminate_from_any_live_state() {
        for (input, reason) in [
            (CheckoutInput::Cancel, CancelReason::UserCancelled),
            (CheckoutInput::Abort, CancelReason::Aborted),
            (CheckoutInput::Timeout, CancelReason::IdleTimeout),
        ] {
            let (dialogue, effect) = run(vec![text("Ada"), text("1234567"), input]);
            assert_eq!(
                dialogue.state,
                CheckoutState::Terminated(Termination::Cancelled(reason))
            );
            assert_eq!(effect, Effect::Cancelled(reason));
        }
    }

    #[test]
    fn terminated_is_absorbing() {
        let (dialogue, _) = run(vec![CheckoutInput::Abort]);
        let (after, effect) = dialogue.clone().apply(text("Ada"));
        assert_eq!(effect, Effect::Ignored);
        assert_eq!(after, dialogue);
        let (_, effect) = after.apply(CheckoutInput::Timeout);
        assert_eq!(effect, Effect::Ignored);
    }

    #[test]
    fn stray_inputs_repeat_the_question() {
        let (dialogue, effect) = run(vec![CheckoutInput::Confirm]);
        assert_eq!(dialogue.state, CheckoutState::CollectingName);
        assert_eq!(effect, Effect::Prompt(Field::Name));

        let (dialogue, effect) = run(vec![text("Ada"), CheckoutInput::SkipEmail]);
        assert_eq!(dialogue.state, CheckoutState::CollectingPhone);
        assert_eq!(effect, Effect::Prompt(Field::Phone));

        let (dialogue, effect) = run(vec![
            text("Ada"),
            text("1234567"),
            text("Main street 1"),
            CheckoutInput::SkipEmail,
            text("hello"),
        ]);
        assert_eq!(dialogue.state, CheckoutState::AwaitingConfirmation);
        assert_eq!(effect, Effect::RenderSummary);
    }
}
