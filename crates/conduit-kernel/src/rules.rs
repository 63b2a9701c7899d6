//! [`RuleSet`] – named property-rewriting rules.
//!
//! A rule is an ordered list of [`RuleMatch`]es. Each match holds one or more
//! [`Interest`]s and the properties to apply when any of them matches. Rules
//! are written as JSON:
//!
//! ```json
//! [
//!   {
//!     "matches": [ { "application.name": "~fire*" }, { "media.role": "Game" } ],
//!     "actions": { "update-props": { "node.latency": "512/48000" } }
//!   }
//! ]
//! ```
//!
//! Inside a match object every key/value pair becomes a constraint on the
//! object's native properties: a value starting with `~` is a glob
//! ([`Verb::Matches`]), anything else must be equal. Entries that cannot be
//! understood are skipped with a warning, the rest of the rule still loads.

use conduit_types::{Category, ConduitError, PropertyBag};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::interest::{Constraint, Domain, Interest, Value, Verb};

/// One `matches`/`actions` pair of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub interests: Vec<Interest>,
    pub actions: PropertyBag,
}

/// A named, ordered list of [`RuleMatch`]es.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub matches: Vec<RuleMatch>,
}

impl Rule {
    /// Parse a rule from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ConstraintInvalid`] when the text is not JSON
    /// or is not an array.
    pub fn parse(name: &str, json: &str) -> Result<Self, ConduitError> {
        let value: Json = serde_json::from_str(json)
            .map_err(|e| ConduitError::ConstraintInvalid(format!("rule '{name}': {e}")))?;
        Self::from_json(name, &value)
    }

    pub fn from_json(name: &str, value: &Json) -> Result<Self, ConduitError> {
        let Json::Array(entries) = value else {
            return Err(ConduitError::ConstraintInvalid(format!(
                "rule '{name}' must be a JSON array"
            )));
        };

        let mut matches = Vec::new();
        for entry in entries {
            let (Some(m), Some(a)) = (entry.get("matches"), entry.get("actions")) else {
                warn!(rule = name, "rule entry without matches or actions, skipping it");
                continue;
            };
            let interests = parse_matches(name, m);
            let actions = parse_actions(name, a);
            debug!(
                rule = name,
                interests = interests.len(),
                actions = actions.len(),
                "loaded rule match"
            );
            matches.push(RuleMatch { interests, actions });
        }

        Ok(Rule {
            name: name.to_string(),
            matches,
        })
    }

    /// Actions of the first match (in declaration order) with an interest
    /// that accepts `props`.
    pub fn evaluate(&self, props: &PropertyBag) -> Option<&PropertyBag> {
        self.matches
            .iter()
            .find(|m| m.interests.iter().any(|i| i.matches_properties(props)))
            .map(|m| &m.actions)
    }
}

fn parse_matches(rule: &str, value: &Json) -> Vec<Interest> {
    let Json::Array(objects) = value else {
        warn!(rule, "\"matches\" must be an array, skipping it");
        return Vec::new();
    };

    let mut interests = Vec::new();
    for object in objects {
        let Json::Object(fields) = object else {
            warn!(rule, "match entry is not an object, skipping it");
            continue;
        };
        let mut interest = Interest::new(Category::Properties);
        for (subject, raw) in fields {
            let Some(text) = scalar_to_string(raw) else {
                warn!(rule, subject = %subject, "misplaced container in match, skipping it");
                continue;
            };
            let (verb, text) = match text.strip_prefix('~') {
                Some(pattern) => (Verb::Matches, pattern.to_string()),
                None => (Verb::Equals, text),
            };
            interest.add_constraint(Constraint::new(
                Domain::NativeProperty,
                subject.clone(),
                verb,
                Some(Value::Str(text)),
            ));
        }
        if let Err(e) = interest.validate() {
            warn!(rule, error = %e, "invalid match, skipping it");
            continue;
        }
        interests.push(interest);
    }
    interests
}

fn parse_actions(rule: &str, value: &Json) -> PropertyBag {
    let mut actions = PropertyBag::new();
    let Some(Json::Object(updates)) = value.get("update-props") else {
        warn!(rule, "\"update-props\" not defined properly, skipping it");
        return actions;
    };
    for (key, raw) in updates {
        match scalar_to_string(raw) {
            Some(v) => {
                actions.set(key.clone(), v);
            }
            None => warn!(rule, key = %key, "non-scalar action value, skipping it"),
        }
    }
    actions
}

fn scalar_to_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Number(n) => Some(n.to_string()),
        Json::Null => Some("null".to_string()),
        Json::Array(_) | Json::Object(_) => None,
    }
}

/// Collection of rules addressed by name.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `rule`, replacing any rule with the same name.
    pub fn insert(&mut self, rule: Rule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Rule> {
        let pos = self.rules.iter().position(|r| r.name == name)?;
        Some(self.rules.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply rule `name` to `props`.
    ///
    /// When a match is found its actions are merged into `applied` if given,
    /// otherwise into `props` itself, and `true` is returned.
    pub fn apply(&self, name: &str, props: &mut PropertyBag, applied: Option<&mut PropertyBag>) -> bool {
        let Some(actions) = self.get(name).and_then(|r| r.evaluate(props)) else {
            return false;
        };
        debug!(rule = name, actions = actions.len(), "rule matched");
        match applied {
            Some(target) => target.update_from(actions),
            None => props.update_from(actions),
        }
        true
    }
}
