//! [`Settings`] – typed view over the entries of a settings metadata store.
//!
//! Every entry is either a plain setting (a string value) or a rule. A value
//! is a rule when it parses as a JSON array whose first element is an object;
//! rules go to the embedded [`RuleSet`] and are applied with
//! [`Settings::apply_rule`].
//!
//! Subscribers register a glob pattern and are called with the setting name
//! and new value whenever a plain setting whose name matches is changed or
//! removed.
//!
//! ```
//! use std::{cell::RefCell, rc::Rc};
//! use conduit_kernel::settings::Settings;
//!
//! let mut settings = Settings::new("sm-settings");
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! settings.subscribe("device.*", move |name, _| sink.borrow_mut().push(name.to_string()));
//!
//! settings.update("device.restore-profile", Some("true"));
//! settings.update("node.stream.default-volume", Some("0.4"));
//!
//! assert_eq!(settings.get_bool("device.restore-profile"), Some(true));
//! assert_eq!(*seen.borrow(), ["device.restore-profile"]);
//! ```

use std::collections::BTreeMap;

use conduit_types::PropertyBag;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::pattern::glob_match;
use crate::rules::{Rule, RuleSet};

/// Name of the metadata store settings are read from unless configured.
pub const DEFAULT_METADATA_NAME: &str = "sm-settings";

/// Handle returned by [`Settings::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&str, Option<&str>)>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    callback: Callback,
}

/// Plain settings, rules and change subscriptions of one metadata store.
pub struct Settings {
    metadata_name: String,
    values: BTreeMap<String, String>,
    rules: RuleSet,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
}

impl Settings {
    pub fn new(metadata_name: impl Into<String>) -> Self {
        Self {
            metadata_name: metadata_name.into(),
            values: BTreeMap::new(),
            rules: RuleSet::new(),
            subscriptions: Vec::new(),
            next_subscription: 1,
        }
    }

    pub fn metadata_name(&self) -> &str {
        &self.metadata_name
    }

    /// Load a full set of entries without notifying subscribers.
    pub fn load<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in entries {
            self.store(key, value);
        }
        info!(
            metadata = %self.metadata_name,
            settings = self.values.len(),
            rules = self.rules.len(),
            "loaded settings"
        );
    }

    /// Apply one changed entry. `None` removes it.
    ///
    /// Plain setting changes are logged and delivered to every subscriber
    /// whose pattern matches `key`.
    pub fn update(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => {
                if !self.store(key, value) {
                    return;
                }
            }
            None => {
                if self.rules.remove(key).is_some() {
                    info!(metadata = %self.metadata_name, rule = key, "rule removed");
                    return;
                }
                if self.values.remove(key).is_none() {
                    return;
                }
                info!(metadata = %self.metadata_name, setting = key, "setting removed");
            }
        }

        for sub in self.subscriptions.iter_mut() {
            if glob_match(&sub.pattern, key) {
                (sub.callback)(key, value);
                debug!(subscription = sub.id.0, setting = key, "triggered settings callback");
            }
        }
    }

    /// Returns `true` for plain settings, `false` for rules.
    fn store(&mut self, key: &str, value: &str) -> bool {
        if let Some(json) = rule_json(value) {
            match Rule::from_json(key, &json) {
                Ok(rule) => {
                    debug!(metadata = %self.metadata_name, rule = key, matches = rule.matches.len(), "rule loaded");
                    self.rules.insert(rule);
                }
                Err(e) => warn!(rule = key, error = %e, "failed to parse rule"),
            }
            return false;
        }

        match self.values.insert(key.to_string(), value.to_string()) {
            None => info!(setting = key, value, "new setting defined"),
            Some(old) if old != value => {
                info!(setting = key, old = %old, new = value, "setting changed")
            }
            Some(_) => {}
        }
        true
    }

    /// `true` for `"true"` or `"1"`, `false` for anything else.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).map(|v| v == "true" || v == "1")
    }

    /// `0` when the value is not an integer.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).map(|v| v.trim().parse().unwrap_or(0))
    }

    /// `0.0` when the value is not a number.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.values.get(key).map(|v| v.trim().parse().unwrap_or(0.0))
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// See [`RuleSet::apply`].
    pub fn apply_rule(&self, rule: &str, props: &mut PropertyBag, applied: Option<&mut PropertyBag>) -> bool {
        self.rules.apply(rule, props, applied)
    }

    /// Call `callback(name, value)` on every change of a setting whose name
    /// glob-matches `pattern`.
    pub fn subscribe<F>(&mut self, pattern: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: FnMut(&str, Option<&str>) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push(Subscription {
            id,
            pattern: pattern.into(),
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Plain settings as a property bag, in name order.
    pub fn to_property_bag(&self) -> PropertyBag {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_NAME)
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("metadata_name", &self.metadata_name)
            .field("values", &self.values)
            .field("rules", &self.rules)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// The parsed value when it is an array whose first element is an object.
fn rule_json(value: &str) -> Option<Json> {
    let json: Json = serde_json::from_str(value).ok()?;
    match json.as_array()?.first()? {
        Json::Object(_) => Some(json),
        _ => None,
    }
}
