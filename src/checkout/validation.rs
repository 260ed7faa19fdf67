//! Field validators for the checkout dialogue.
//!
//! Each validator trims its input and returns the normalized value, or the
//! corrective prompt to show the user.

use once_cell::sync::Lazy;
use regex::Regex;

// Letters of any script (with combining marks) and plain spaces.
static NAME_RE: Lazy<Regex> = Lazy::new(|| compiled(r"^[\p{L}\p{M} ]+$"));
// ASCII digits only; `\d` would admit every Unicode decimal digit.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| compiled(r"^\+?[0-9]{7,15}$"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| compiled(r"^[^@\s]+@[^@\s]+\.[^@\s]+$"));

const MIN_NAME_LETTERS: usize = 2;
const MIN_ADDRESS_LEN: usize = 5;

fn compiled(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => unreachable!("static pattern {pattern} failed to compile: {e}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Phone,
    Address,
    Email,
}

/// A rejected field value with the prompt that explains how to fix it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: Field,
    pub prompt: &'static str,
}

pub fn validate_name(input: &str) -> Result<String, FieldError> {
    let value = input.trim();
    let letters = value.chars().filter(|c| c.is_alphabetic()).count();
    if NAME_RE.is_match(value) && letters >= MIN_NAME_LETTERS {
        Ok(value.to_string())
    } else {
        Err(FieldError {
            field: Field::Name,
            prompt: "Please enter a valid name: letters and spaces only, at least 2 letters.",
        })
    }
}

pub fn validate_phone(input: &str) -> Result<String, FieldError> {
    let value = input.trim();
    if PHONE_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(FieldError {
            field: Field::Phone,
            prompt: "Please enter a valid phone number: 7 to 15 digits, optionally starting with +.",
        })
    }
}

pub fn validate_address(input: &str) -> Result<String, FieldError> {
    let value = input.trim();
    if value.chars().count() >= MIN_ADDRESS_LEN {
        Ok(value.to_string())
    } else {
        Err(FieldError {
            field: Field::Address,
            prompt: "Please enter a complete delivery address (at least 5 characters).",
        })
    }
}

pub fn validate_email(input: &str) -> Result<String, FieldError> {
    let value = input.trim();
    if EMAIL_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(FieldError {
            field: Field::Email,
            prompt: "Please enter a valid email like name@example.com, or send /skip.",
        })
    }
}
