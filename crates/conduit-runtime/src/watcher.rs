//! The [`Watcher`] trait policy modules implement.
//!
//! A watcher is registered with a list of interests and an optional target
//! feature set. The registry calls it whenever a global starts matching,
//! changes while matching, stops matching, or, when a target was given,
//! reaches that target (or fails to).
//!
//! Callbacks cannot reach back into the registry. Instead they queue
//! commands on the [`WatcherContext`] they are handed:
//!
//! | Command | Takes effect |
//! |---|---|
//! | [`WatcherContext::deregister`] | immediately: no further callbacks in the current pass |
//! | [`WatcherContext::request_activation`] | after the current pass |

use conduit_types::{ActivationError, Features};

use crate::registry::GlobalView;

/// Handle returned by [`Registry::register_watcher`][crate::registry::Registry::register_watcher].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub(crate) u64);

impl std::fmt::Display for WatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

pub trait Watcher {
    /// `global` started matching one of the watcher's interests.
    fn on_added(&mut self, cx: &mut WatcherContext, global: &GlobalView<'_>);

    /// Global `id` stopped matching, or was removed.
    fn on_removed(&mut self, _cx: &mut WatcherContext, _id: u32) {}

    /// `global` changed and still matches.
    fn on_updated(&mut self, _cx: &mut WatcherContext, _global: &GlobalView<'_>) {}

    /// An activation requested for global `id` finished. Called exactly once
    /// per request.
    fn on_ready(&mut self, _cx: &mut WatcherContext, _id: u32, _result: Result<&GlobalView<'_>, ActivationError>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Deregister(WatcherId),
    Activate {
        watcher: WatcherId,
        global: u32,
        features: Features,
    },
}

/// Command sink handed to every [`Watcher`] callback.
#[derive(Debug)]
pub struct WatcherContext {
    watcher: WatcherId,
    commands: Vec<Command>,
}

impl WatcherContext {
    pub(crate) fn new(watcher: WatcherId) -> Self {
        Self {
            watcher,
            commands: Vec::new(),
        }
    }

    /// The watcher being called.
    pub fn id(&self) -> WatcherId {
        self.watcher
    }

    /// Deregister the calling watcher.
    pub fn deregister(&mut self) {
        self.commands.push(Command::Deregister(self.watcher));
    }

    /// Deregister another watcher.
    pub fn deregister_watcher(&mut self, id: WatcherId) {
        self.commands.push(Command::Deregister(id));
    }

    /// Bind global `global` if needed and bring it to `features`; the result
    /// arrives as [`Watcher::on_ready`].
    pub fn request_activation(&mut self, global: u32, features: Features) {
        self.commands.push(Command::Activate {
            watcher: self.watcher,
            global,
            features,
        });
    }

    pub(crate) fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
