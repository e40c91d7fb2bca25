//! API endpoint handlers.
//!
//! Handlers stay thin: parse the request, hand blocking work to
//! `spawn_blocking`, map errors through `ApiError`.

pub mod analysis;
pub mod catalog;
pub mod health;
pub mod models;
