//! Proxies and the feature-activation engine.
//!
//! A [`Proxy`] is the local representation of a remote object. It carries
//! the set of active [`Features`] plus the caches those features stand for,
//! and any number of in-flight [`Transition`]s, each trying to reach its own
//! target feature set.
//!
//! # Transition lifecycle
//!
//! ```text
//!  Idle ──► Stepping(step) ──► Complete ──► (next step, or Done)
//!                │
//!                └──► Suspend ──► Suspended(step) ──(features changed)──► re-evaluate
//! ```
//!
//! [`advance`] drives every non-terminal transition of a proxy to a fixpoint:
//! a step completed for one transition may satisfy another's missing set. A
//! suspended transition whose next step is still the one it is waiting on
//! stays suspended.
//!
//! Finished transitions are removed from the proxy and returned to the
//! caller, which owns delivering each result exactly once.

use std::collections::{BTreeMap, BTreeSet};

use conduit_middleware::Transport;
use conduit_types::{ActivationError, Features, ObjectKind, ParamBlob, ParamKind, PropertyBag, ProxyEvent, ProxyHandle};
use tracing::{debug, warn};

use crate::policy::{self, Step, StepOutcome};

/// Key of a proxy in the registry's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(pub(crate) u64);

impl std::fmt::Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionState {
    Idle,
    Stepping(Step),
    Suspended(Step),
    Done,
    Failed(ActivationError),
}

impl TransitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransitionState::Done | TransitionState::Failed(_))
    }
}

/// One request to bring a proxy up to `target`.
#[derive(Debug, Clone)]
pub struct Transition {
    id: TransitionId,
    target: Features,
    state: TransitionState,
}

impl Transition {
    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn target(&self) -> Features {
        self.target
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }
}

/// Result of a finished transition: the active features on success.
pub type Finished = (TransitionId, Result<Features, ActivationError>);

/// Where a proxy comes from, which decides how `Bind` creates its handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    /// Bound to an existing global.
    Global(u32),
    /// Implemented locally and exported with these properties.
    Local(PropertyBag),
}

/// One cached metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    pub value_type: Option<String>,
    pub value: String,
}

/// What absorbing an event did to a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Absorbed {
    /// Features the event made available.
    pub gained: Features,
    /// Cached state visible to interests changed.
    pub changed: bool,
}

#[derive(Debug)]
pub struct Proxy {
    id: ProxyId,
    kind: ObjectKind,
    origin: Origin,
    handle: Option<ProxyHandle>,
    bound_id: Option<u32>,
    attached: Option<u32>,
    active: Features,
    transitions: Vec<Transition>,
    info: Option<PropertyBag>,
    params: BTreeMap<ParamKind, Vec<ParamBlob>>,
    pending_params: BTreeSet<ParamKind>,
    controls: Option<Vec<ParamBlob>>,
    metadata: BTreeMap<(u32, String), MetadataValue>,
    sync_pending: bool,
    metadata_loaded: bool,
}

impl Proxy {
    fn blank(id: ProxyId, kind: ObjectKind, origin: Origin) -> Self {
        Self {
            id,
            kind,
            origin,
            handle: None,
            bound_id: None,
            attached: None,
            active: Features::empty(),
            transitions: Vec::new(),
            info: None,
            params: BTreeMap::new(),
            pending_params: BTreeSet::new(),
            controls: None,
            metadata: BTreeMap::new(),
            sync_pending: false,
            metadata_loaded: false,
        }
    }

    /// A proxy for global `global_id`, already bound through `handle`.
    pub fn for_global(id: ProxyId, kind: ObjectKind, global_id: u32, handle: ProxyHandle) -> Self {
        let mut proxy = Self::blank(id, kind, Origin::Global(global_id));
        proxy.handle = Some(handle);
        proxy.bound_id = Some(global_id);
        proxy.active = Features::MINIMAL;
        proxy
    }

    /// A not yet exported local object.
    pub fn local(id: ProxyId, kind: ObjectKind, properties: PropertyBag) -> Self {
        Self::blank(id, kind, Origin::Local(properties))
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn handle(&self) -> Option<ProxyHandle> {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: Option<ProxyHandle>) {
        self.handle = handle;
    }

    /// Global id the server knows this object under.
    pub fn bound_id(&self) -> Option<u32> {
        self.bound_id
    }

    /// Global this proxy is attached to in the registry.
    pub fn attached(&self) -> Option<u32> {
        self.attached
    }

    pub(crate) fn set_attached(&mut self, global: Option<u32>) {
        self.attached = global;
    }

    pub fn active(&self) -> Features {
        self.active
    }

    pub(crate) fn add_active(&mut self, features: Features) {
        self.active |= features;
    }

    pub(crate) fn remove_active(&mut self, features: Features) {
        self.active.remove(features);
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Native info properties, once received.
    pub fn info(&self) -> Option<&PropertyBag> {
        self.info.as_ref()
    }

    pub(crate) fn set_info(&mut self, properties: PropertyBag) {
        self.info = Some(properties);
    }

    pub(crate) fn clear_info(&mut self) {
        self.info = None;
    }

    pub fn params(&self, param: ParamKind) -> Option<&[ParamBlob]> {
        self.params.get(&param).map(Vec::as_slice)
    }

    pub(crate) fn param_pending(&self, param: ParamKind) -> bool {
        self.pending_params.contains(&param)
    }

    pub(crate) fn set_param_pending(&mut self, param: ParamKind) {
        self.pending_params.insert(param);
    }

    pub(crate) fn clear_params(&mut self, param: ParamKind) {
        self.params.remove(&param);
        self.pending_params.remove(&param);
    }

    pub fn controls(&self) -> Option<&[ParamBlob]> {
        self.controls.as_deref()
    }

    pub(crate) fn set_controls(&mut self, controls: Option<Vec<ParamBlob>>) {
        self.controls = controls;
    }

    /// Cached metadata entries, ordered by subject then key.
    pub fn metadata(&self) -> impl Iterator<Item = (u32, &str, &MetadataValue)> {
        self.metadata.iter().map(|((s, k), v)| (*s, k.as_str(), v))
    }

    pub fn metadata_entry(&self, subject: u32, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(&(subject, key.to_string()))
    }

    pub(crate) fn metadata_loaded(&self) -> bool {
        self.metadata_loaded
    }

    pub(crate) fn sync_pending(&self) -> bool {
        self.sync_pending
    }

    pub(crate) fn set_sync_pending(&mut self, pending: bool) {
        self.sync_pending = pending;
    }

    pub(crate) fn clear_metadata(&mut self) {
        self.metadata.clear();
        self.sync_pending = false;
        self.metadata_loaded = false;
    }

    /// Fold a server event into the caches.
    ///
    /// `Error` and `Removed` are lifecycle events handled by the registry and
    /// leave the proxy untouched.
    pub fn absorb(&mut self, event: &ProxyEvent) -> Absorbed {
        let mut out = Absorbed::default();
        match event {
            ProxyEvent::Bound { global_id } => {
                if let Some(old) = self.bound_id.filter(|old| old != global_id) {
                    warn!(proxy = %self.id, old, new = global_id, "proxy re-bound to a different global");
                }
                self.bound_id = Some(*global_id);
                if self.handle.is_some() {
                    out.gained = Features::BOUND;
                }
            }
            ProxyEvent::Info { properties } => {
                self.info = Some(properties.clone());
                out.gained = Features::INFO;
                out.changed = true;
            }
            ProxyEvent::Params { param, values } => {
                self.params.insert(*param, values.clone());
                self.pending_params.remove(param);
                if self.active.contains(Features::CONTROLS) && *param == ParamKind::Props {
                    self.controls = Some(values.clone());
                }
                // A kind without the param keeps the values but never gains the bit.
                out.gained = param.feature() & policy::supported_features(self.kind);
                out.changed = true;
            }
            ProxyEvent::MetadataEntry {
                subject,
                key,
                value_type,
                value,
            } => {
                let slot = (*subject, key.clone());
                match value {
                    Some(value) => {
                        self.metadata.insert(
                            slot,
                            MetadataValue {
                                value_type: value_type.clone(),
                                value: value.clone(),
                            },
                        );
                    }
                    None => {
                        self.metadata.remove(&slot);
                    }
                }
                out.changed = true;
            }
            ProxyEvent::Done => {
                if self.sync_pending {
                    self.sync_pending = false;
                    self.metadata_loaded = true;
                    out.gained = Features::METADATA_DATA;
                }
            }
            ProxyEvent::Error { .. } | ProxyEvent::Removed => {}
        }
        out.gained -= self.active;
        out
    }

    pub(crate) fn start_transition(&mut self, id: TransitionId, target: Features) {
        debug!(proxy = %self.id, kind = %self.kind, ?target, "transition started");
        self.transitions.push(Transition {
            id,
            target,
            state: TransitionState::Idle,
        });
    }

    /// Drop a transition without reporting it.
    pub(crate) fn cancel_transition(&mut self, id: TransitionId) -> bool {
        let before = self.transitions.len();
        self.transitions.retain(|t| t.id != id);
        self.transitions.len() != before
    }

    fn take_finished(&mut self) -> Vec<Finished> {
        let active = self.active;
        let (finished, running): (Vec<_>, Vec<_>) =
            self.transitions.drain(..).partition(|t| t.state.is_terminal());
        self.transitions = running;
        finished
            .into_iter()
            .map(|t| match t.state {
                TransitionState::Failed(e) => (t.id, Err(e)),
                _ => (t.id, Ok(active)),
            })
            .collect()
    }
}

/// Drive every non-terminal transition of `proxy` as far as it can go.
pub fn advance(proxy: &mut Proxy, transport: &mut dyn Transport) -> Vec<Finished> {
    loop {
        let mut progressed = false;

        for i in 0..proxy.transitions.len() {
            if proxy.transitions[i].state.is_terminal() {
                continue;
            }
            let missing = proxy.transitions[i].target - proxy.active;
            if missing.is_empty() {
                proxy.transitions[i].state = TransitionState::Done;
                progressed = true;
                continue;
            }

            let step = match policy::next_step(proxy.kind, proxy, missing) {
                Ok(Some(step)) => step,
                Ok(None) => {
                    proxy.transitions[i].state = TransitionState::Done;
                    progressed = true;
                    continue;
                }
                Err(e) => {
                    proxy.transitions[i].state = TransitionState::Failed(e);
                    progressed = true;
                    continue;
                }
            };

            if proxy.transitions[i].state == TransitionState::Suspended(step) {
                continue;
            }

            proxy.transitions[i].state = TransitionState::Stepping(step);
            match policy::execute_step(step, proxy, transport) {
                Ok(StepOutcome::Complete(features)) => {
                    let gained = features - proxy.active;
                    if gained.is_empty() {
                        proxy.transitions[i].state =
                            TransitionState::Failed(ActivationError::StepFailed(format!("{step:?} made no progress")));
                    } else {
                        proxy.active |= gained;
                        proxy.transitions[i].state = TransitionState::Idle;
                    }
                    progressed = true;
                }
                Ok(StepOutcome::Suspend) => {
                    proxy.transitions[i].state = TransitionState::Suspended(step);
                }
                Err(e) => {
                    proxy.transitions[i].state = TransitionState::Failed(e);
                    progressed = true;
                }
            }
        }

        if !progressed {
            break;
        }
    }

    proxy.take_finished()
}

/// Fail every non-terminal transition of `proxy` with `error`.
pub fn fail_all(proxy: &mut Proxy, error: ActivationError) -> Vec<Finished> {
    for t in proxy.transitions.iter_mut() {
        if !t.state.is_terminal() {
            t.state = TransitionState::Failed(error.clone());
        }
    }
    proxy.take_finished()
}
