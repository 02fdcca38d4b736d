//! HTTP request handlers.
//!
//! This module contains all the endpoint handlers for the gateway API.

pub mod admin;
pub mod catalog;
pub mod health;
pub mod internal;
pub mod ssh_keys;
pub mod terminal;
pub mod users;
pub mod vms;
