//! Watcher that keeps a [`Settings`] in sync with a settings metadata store.
//!
//! The loader watches the `Metadata` global whose `metadata.name` is the
//! configured store name, activates it up to [`TARGET`] and loads every
//! subject-0 entry into the shared [`Settings`] once the initial sync
//! completes. Afterwards each metadata change is diffed against the last
//! snapshot and forwarded through [`Settings::update`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use conduit_kernel::interest::{Domain, Interest, Verb};
use conduit_kernel::settings::Settings;
use conduit_types::{ActivationError, ConduitError, Features, ObjectKind};
use tracing::{debug, info, warn};

use crate::registry::{GlobalView, Registry};
use crate::watcher::{Watcher, WatcherContext, WatcherId};

/// Features a settings store must reach before it is read.
pub const TARGET: Features = Features::MINIMAL.union(Features::METADATA_DATA);

type Snapshot = BTreeMap<String, String>;

pub struct SettingsLoader {
    settings: Rc<RefCell<Settings>>,
    snapshots: HashMap<u32, Snapshot>,
}

impl SettingsLoader {
    pub fn new(settings: Rc<RefCell<Settings>>) -> Self {
        Self {
            settings,
            snapshots: HashMap::new(),
        }
    }

    /// The interest selecting the metadata store called `name`.
    pub fn interest(name: &str) -> Interest {
        let mut interest = Interest::new(ObjectKind::Metadata);
        interest.add_constraint(conduit_kernel::Constraint::new(
            Domain::GlobalProperty,
            "metadata.name",
            Verb::Equals,
            Some(name.into()),
        ));
        interest
    }

    /// Register a loader for `settings` with `registry`.
    pub fn register(registry: &mut Registry, settings: Rc<RefCell<Settings>>) -> Result<WatcherId, ConduitError> {
        let name = settings.borrow().metadata_name().to_string();
        let id = registry.register_watcher(vec![Self::interest(&name)], TARGET, Self::new(settings))?;
        info!(watcher = %id, metadata = %name, "settings loader registered");
        Ok(id)
    }
}

fn snapshot(global: &GlobalView<'_>) -> Snapshot {
    global
        .proxy()
        .map(|p| {
            p.metadata()
                .filter(|(subject, _, _)| *subject == 0)
                .map(|(_, key, v)| (key.to_string(), v.value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

impl Watcher for SettingsLoader {
    fn on_added(&mut self, _cx: &mut WatcherContext, global: &GlobalView<'_>) {
        debug!(id = global.id(), "settings metadata found");
    }

    fn on_ready(&mut self, _cx: &mut WatcherContext, id: u32, result: Result<&GlobalView<'_>, ActivationError>) {
        let global = match result {
            Ok(global) => global,
            Err(e) => {
                warn!(id, error = %e, "settings metadata could not be activated");
                return;
            }
        };
        let entries = snapshot(global);
        self.settings
            .borrow_mut()
            .load(entries.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.snapshots.insert(id, entries);
    }

    fn on_updated(&mut self, _cx: &mut WatcherContext, global: &GlobalView<'_>) {
        // Entries streamed during the initial sync are loaded by on_ready.
        let Some(old) = self.snapshots.get_mut(&global.id()) else {
            return;
        };
        let new = snapshot(global);
        let mut settings = self.settings.borrow_mut();

        for (key, value) in &new {
            if old.get(key) != Some(value) {
                settings.update(key, Some(value));
            }
        }
        for key in old.keys().filter(|k| !new.contains_key(*k)) {
            settings.update(key, None);
        }
        *old = new;
    }

    fn on_removed(&mut self, _cx: &mut WatcherContext, id: u32) {
        if self.snapshots.remove(&id).is_some() {
            warn!(id, "settings metadata went away, keeping last known settings");
        }
    }
}
