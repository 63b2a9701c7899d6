//! `conduit-memory` – Persistent State.
//!
//! Lets policy code remember decisions across restarts (chosen profiles,
//! stream volumes, default nodes) using plain text files under the user's
//! configuration directory.
//!
//! # Modules
//!
//! - [`state`] – [`StateStore`][state::StateStore]: one named key/value file
//!   with escaped keys and atomic replace-on-save.

pub mod state;

pub use state::StateStore;
