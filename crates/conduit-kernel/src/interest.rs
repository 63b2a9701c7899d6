//! [`Interest`] – declarative object selection.
//!
//! An interest is a [`Category`] plus an ordered list of [`Constraint`]s.
//! It matches an object when the category is compatible and **every**
//! constraint holds against the property bag selected by its [`Domain`].
//! There is no OR; add another interest for alternatives.
//!
//! Matching is a pure function of its inputs. Interests must be validated
//! before use: [`InterestBuilder::build`] and [`Interest::validate`] reject
//! malformed constraints up front so that matching never has to.
//!
//! # Example
//!
//! ```
//! use conduit_kernel::interest::{Domain, Interest, PropertySources, Value, Verb};
//! use conduit_types::{Category, ObjectKind, PropertyBag};
//!
//! let interest = Interest::builder(ObjectKind::Node)
//!     .constrain(Domain::GlobalProperty, "media.class", Verb::Equals, Value::from("Audio/Sink"))
//!     .constrain(Domain::GlobalProperty, "node.name", Verb::Matches, Value::from("alsa_*"))
//!     .build()
//!     .unwrap();
//!
//! let props: PropertyBag = [("media.class", "Audio/Sink"), ("node.name", "alsa_output.pci")]
//!     .into_iter()
//!     .collect();
//! let sources = PropertySources::global_only(&props);
//! assert!(interest.matches(ObjectKind::Node.into(), &sources));
//! assert!(!interest.matches(ObjectKind::Device.into(), &sources));
//! ```

use conduit_types::{Category, ConduitError, PropertyBag};
use serde::{Deserialize, Serialize};

use crate::pattern::glob_match;

/// Separators between alternatives when an `InList` value is given as a
/// single string.
pub const LIST_SEPARATORS: [char; 2] = [',', '|'];

/// Which property bag a constraint reads its subject from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    /// Properties announced with the global on the registry.
    GlobalProperty,
    /// Native properties reported by the bound object itself.
    NativeProperty,
    /// Local attributes of the object (`id`, `kind`, `permissions`, ...).
    Attribute,
}

/// Comparison applied to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Equals,
    NotEquals,
    InList,
    InRange,
    Matches,
    IsPresent,
    IsAbsent,
}

impl Verb {
    /// Single-character shorthand, as used in logs.
    pub fn symbol(&self) -> char {
        match self {
            Verb::Equals => '=',
            Verb::NotEquals => '!',
            Verb::InList => 'c',
            Verb::InRange => '~',
            Verb::Matches => '#',
            Verb::IsPresent => '+',
            Verb::IsAbsent => '-',
        }
    }
}

/// Right-hand side of a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    List(Vec<String>),
    Range { min: String, max: String },
}

impl Value {
    pub fn range(min: impl ToString, max: impl ToString) -> Self {
        Value::Range {
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// A single predicate over one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub domain: Domain,
    pub subject: String,
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Constraint {
    pub fn new(domain: Domain, subject: impl Into<String>, verb: Verb, value: Option<Value>) -> Self {
        Self {
            domain,
            subject: subject.into(),
            verb,
            value,
        }
    }

    fn validate(&self) -> Result<(), ConduitError> {
        let invalid = |why: &str| {
            Err(ConduitError::ConstraintInvalid(format!(
                "{} {} on '{}': {why}",
                self.verb.symbol(),
                domain_name(self.domain),
                self.subject
            )))
        };

        if self.subject.is_empty() {
            return invalid("empty subject");
        }

        match (&self.verb, &self.value) {
            (Verb::IsPresent | Verb::IsAbsent, None) => Ok(()),
            (Verb::IsPresent | Verb::IsAbsent, Some(_)) => invalid("verb takes no value"),
            (_, None) => invalid("verb requires a value"),
            (Verb::Equals | Verb::NotEquals | Verb::Matches, Some(Value::Str(s))) => {
                if s.is_empty() {
                    invalid("empty value")
                } else {
                    Ok(())
                }
            }
            (Verb::InList, Some(Value::Str(s))) => {
                if s.split(LIST_SEPARATORS).any(str::is_empty) {
                    invalid("empty list alternative")
                } else {
                    Ok(())
                }
            }
            (Verb::InList, Some(Value::List(items))) => {
                if items.is_empty() || items.iter().any(String::is_empty) {
                    invalid("list must hold non-empty alternatives")
                } else {
                    Ok(())
                }
            }
            (Verb::InRange, Some(Value::Range { min, max })) => {
                match (parse_number(min), parse_number(max)) {
                    (Some(_), Some(_)) => Ok(()),
                    _ => invalid("range bounds must be numeric"),
                }
            }
            (_, Some(_)) => invalid("value shape does not fit verb"),
        }
    }

    /// Evaluate against `props`, the bag selected by this constraint's domain.
    fn evaluate(&self, props: Option<&PropertyBag>) -> bool {
        let subject = props.and_then(|p| p.get(&self.subject));

        let Some(subject) = subject else {
            return self.verb == Verb::IsAbsent;
        };

        match (&self.verb, &self.value) {
            (Verb::IsPresent, _) => true,
            (Verb::IsAbsent, _) => false,
            (Verb::Equals, Some(Value::Str(v))) => subject == v,
            (Verb::NotEquals, Some(Value::Str(v))) => subject != v,
            (Verb::InList, Some(Value::Str(v))) => v.split(LIST_SEPARATORS).any(|alt| alt == subject),
            (Verb::InList, Some(Value::List(items))) => items.iter().any(|alt| alt == subject),
            (Verb::InRange, Some(Value::Range { min, max })) => {
                match (parse_number(subject), parse_number(min), parse_number(max)) {
                    (Some(x), Some(lo), Some(hi)) => lo <= x && x <= hi,
                    _ => false,
                }
            }
            (Verb::Matches, Some(Value::Str(pattern))) => glob_match(pattern, subject),
            _ => false,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", domain_name(self.domain), self.subject, self.verb.symbol())?;
        match &self.value {
            Some(Value::Str(s)) => write!(f, " {s}"),
            Some(Value::List(items)) => write!(f, " [{}]", items.join(", ")),
            Some(Value::Range { min, max }) => write!(f, " [{min}, {max}]"),
            None => Ok(()),
        }
    }
}

fn domain_name(domain: Domain) -> &'static str {
    match domain {
        Domain::GlobalProperty => "global",
        Domain::NativeProperty => "native",
        Domain::Attribute => "attr",
    }
}

/// Parse an integer or floating-point decimal. `None` on anything else.
fn parse_number(s: &str) -> Option<f64> {
    let n: f64 = s.trim().parse().ok()?;
    n.is_finite().then_some(n)
}

/// The up-to-three bags an object exposes to constraint evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertySources<'a> {
    pub attributes: Option<&'a PropertyBag>,
    pub native: Option<&'a PropertyBag>,
    pub global: Option<&'a PropertyBag>,
}

impl<'a> PropertySources<'a> {
    pub fn global_only(global: &'a PropertyBag) -> Self {
        Self {
            global: Some(global),
            ..Self::default()
        }
    }

    /// Every domain reads the same bag.
    pub fn uniform(bag: &'a PropertyBag) -> Self {
        Self {
            attributes: Some(bag),
            native: Some(bag),
            global: Some(bag),
        }
    }

    fn select(&self, domain: Domain) -> Option<&'a PropertyBag> {
        match domain {
            Domain::GlobalProperty => self.global,
            Domain::NativeProperty => self.native,
            Domain::Attribute => self.attributes,
        }
    }
}

/// Category plus conjunction of constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interest {
    pub category: Category,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Interest {
    /// An interest with no constraints: matches every object of `category`.
    pub fn new(category: impl Into<Category>) -> Self {
        Self {
            category: category.into(),
            constraints: Vec::new(),
        }
    }

    pub fn builder(category: impl Into<Category>) -> InterestBuilder {
        InterestBuilder {
            interest: Interest::new(category),
        }
    }

    /// Append a constraint. Call [`Interest::validate`] before matching.
    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Check every constraint's verb/value invariants.
    pub fn validate(&self) -> Result<(), ConduitError> {
        self.constraints.iter().try_for_each(Constraint::validate)
    }

    /// `true` when `category` is compatible and every constraint holds.
    pub fn matches(&self, category: Category, sources: &PropertySources<'_>) -> bool {
        self.category.is_compatible(category)
            && self
                .constraints
                .iter()
                .all(|c| c.evaluate(sources.select(c.domain)))
    }

    /// Evaluate against a bare property bag, regardless of domain.
    pub fn matches_properties(&self, props: &PropertyBag) -> bool {
        self.matches(Category::Properties, &PropertySources::uniform(props))
    }
}

/// Eagerly validating [`Interest`] builder.
pub struct InterestBuilder {
    interest: Interest,
}

impl InterestBuilder {
    pub fn constrain(
        mut self,
        domain: Domain,
        subject: impl Into<String>,
        verb: Verb,
        value: impl Into<Value>,
    ) -> Self {
        self.interest
            .add_constraint(Constraint::new(domain, subject, verb, Some(value.into())));
        self
    }

    pub fn present(mut self, domain: Domain, subject: impl Into<String>) -> Self {
        self.interest
            .add_constraint(Constraint::new(domain, subject, Verb::IsPresent, None));
        self
    }

    pub fn absent(mut self, domain: Domain, subject: impl Into<String>) -> Self {
        self.interest
            .add_constraint(Constraint::new(domain, subject, Verb::IsAbsent, None));
        self
    }

    pub fn build(self) -> Result<Interest, ConduitError> {
        self.interest.validate()?;
        Ok(self.interest)
    }
}
