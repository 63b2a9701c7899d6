//! `conduit-runtime` – Registry & Activation Engine
//!
//! Everything that holds live state about remote objects and moves it
//! forward as transport events arrive.
//!
//! # Modules
//!
//! - [`registry`] – [`Registry`][registry::Registry]: the table of globals,
//!   proxies and watchers. Consumes one
//!   [`TransportEvent`][conduit_types::TransportEvent] at a time and fans it
//!   out to interested [`Watcher`][watcher::Watcher]s.
//! - [`activation`] – [`Proxy`][activation::Proxy] and the transition driver
//!   that brings a proxy from its active feature set up to a requested
//!   target, suspending whenever it has to wait for the server.
//! - [`policy`] – per-kind supported features, the step order and what each
//!   step asks of the transport.
//! - [`watcher`] – the [`Watcher`][watcher::Watcher] trait and the
//!   [`WatcherContext`][watcher::WatcherContext] callbacks queue commands on.
//! - [`settings_loader`] – [`SettingsLoader`][settings_loader::SettingsLoader]:
//!   a watcher feeding a settings metadata store into
//!   [`Settings`][conduit_kernel::Settings].
//! - [`event_loop`] – [`EventLoop`][event_loop::EventLoop]: drains the event
//!   queue into the registry.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console logs
//!   plus optional OTLP span export.
//!
//! # Threading
//!
//! The registry is single-threaded and holds no locks. Run the
//! [`EventLoop`][event_loop::EventLoop] on a current-thread tokio runtime;
//! other tasks and threads reach it only through an
//! [`EventSender`][conduit_middleware::EventSender].

pub mod activation;
pub mod event_loop;
pub mod policy;
pub mod registry;
pub mod settings_loader;
pub mod telemetry;
pub mod watcher;

pub use activation::{Origin, Proxy, ProxyId, Transition, TransitionId, TransitionState};
pub use event_loop::EventLoop;
pub use policy::{Step, supported_features};
pub use registry::{Global, GlobalView, Registry};
pub use settings_loader::SettingsLoader;
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use watcher::{Watcher, WatcherContext, WatcherId};
