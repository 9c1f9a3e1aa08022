//! HTTP API handlers.
//!
//! Defines the Actix routes for the control bridge, session listing, storage
//! reclamation, track lookups, playlist pins, and asset streaming.

pub mod control;
pub mod health;
pub mod library;
pub mod sessions;
pub mod storage;
pub mod streams;
