// Collaborators
pub mod catalog;
pub mod payment_processor;

// Concurrency primitives
pub mod keyed_lock;

// Core services
pub mod cart_service;
pub mod order_ledger;
pub mod payment_gateway;
