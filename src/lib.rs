//! contact-flow: ordered, deduplicated per-contact conversation handling.
//!
//! Inbound coordinator, outbound deliverer and persistence ledger, glued
//! together by the conversation pipeline.

pub mod admin;
pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod hashing;
pub mod inbound;
pub mod ledger;
pub mod outbound;
pub mod pipeline;
pub mod store;
