//! `conduit-kernel` – Selection & Rules
//!
//! The pure decision layer of Conduit. Nothing in here performs I/O; every
//! function is a deterministic evaluation over property bags.
//!
//! # Modules
//!
//! - [`interest`] – [`Interest`][interest::Interest]: a category plus a
//!   conjunction of [`Constraint`][interest::Constraint]s, used by the registry
//!   to decide which watchers care about an object.
//! - [`pattern`] – `*`/`?` glob matching used by the `Matches` verb and by
//!   settings subscriptions.
//! - [`rules`] – [`RuleSet`][rules::RuleSet]: named match → `update-props`
//!   rules evaluated with the interest engine.
//! - [`settings`] – [`Settings`][settings::Settings]: typed settings and rules
//!   read from a metadata store, with glob-filtered change subscriptions.

pub mod interest;
pub mod pattern;
pub mod rules;
pub mod settings;

pub use interest::{Constraint, Domain, Interest, InterestBuilder, PropertySources, Value, Verb};
pub use rules::{Rule, RuleMatch, RuleSet};
pub use settings::{Settings, SubscriptionId};
