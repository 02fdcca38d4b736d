//! Core types and utilities for flarevm.
//!
//! This crate provides the foundational types used throughout the flarevm service:
//!
//! - **Identifiers**: Strongly-typed IDs for users, VMs, images, offers and SSH keys
//! - **Actors**: The authenticated caller and its role
//!
//! # Example
//!
//! ```
//! use flarevm_core::{Actor, UserId, VmId};
//!
//! let user_id: UserId = "42".parse().unwrap();
//! let actor = Actor::user(user_id);
//! assert!(actor.can_access(user_id));
//!
//! let vm_id = VmId::generate();
//! assert_eq!(vm_id, vm_id.to_string().parse().unwrap());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod actor;
pub mod ids;

pub use actor::{Actor, Role};
pub use ids::{IdError, ImageId, OfferId, SshKeyId, UserId, VmId};
