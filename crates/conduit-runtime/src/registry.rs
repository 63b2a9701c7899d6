//! The registry – single authoritative table of remote objects.
//!
//! [`Registry`] owns every [`Global`] announced by the server, every
//! [`Proxy`] bound locally (in an arena keyed by [`ProxyId`]) and every
//! registered [`Watcher`]. It consumes [`TransportEvent`]s one at a time and
//! fans them out:
//!
//! | Event | Effect |
//! |---|---|
//! | `GlobalAppeared` | insert, evaluate every watcher, `on_added` on match |
//! | `GlobalUpdated` | replace properties, re-evaluate from scratch, synthesize added / updated / removed |
//! | `GlobalRemoved` | `on_removed` to matching watchers, dispose the proxy, erase |
//! | `Proxy` | update the proxy's caches, re-evaluate its global, advance its transitions |
//!
//! Events that contradict the table (duplicate id, unknown handle) are logged
//! as [`ConduitError::ProtocolInconsistency`] and skipped; nothing is fatal.
//!
//! # Dispatch passes
//!
//! Watcher callbacks only see a [`WatcherContext`]. Deregistrations queued
//! there take effect at once (the watcher gets no further callbacks in the
//! current pass) and are erased when the pass ends; activation requests run
//! after the pass. Each public entry point finishes its pass before
//! returning, including any replies the transport produced synchronously.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use conduit_kernel::interest::{Interest, PropertySources};
use conduit_middleware::{Request, Transport};
use conduit_types::{
    ActivationError, ConduitError, Features, ObjectKind, Permissions, PropertyBag, ProxyEvent, ProxyHandle,
    TransportEvent,
};
use tracing::{debug, error, info, warn};

use crate::activation::{self, Finished, Origin, Proxy, ProxyId, TransitionId};
use crate::policy;
use crate::watcher::{Command, Watcher, WatcherContext, WatcherId};

// ─────────────────────────────────────────────────────────────────────────────
// Globals
// ─────────────────────────────────────────────────────────────────────────────

/// A remote object known by id.
#[derive(Debug, Clone)]
pub struct Global {
    id: u32,
    kind: ObjectKind,
    permissions: Permissions,
    properties: Arc<PropertyBag>,
    proxy: Option<ProxyId>,
}

impl Global {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    pub fn proxy(&self) -> Option<ProxyId> {
        self.proxy
    }
}

/// Read-only view of a global together with its proxy, if bound.
#[derive(Debug, Clone, Copy)]
pub struct GlobalView<'a> {
    global: &'a Global,
    proxy: Option<&'a Proxy>,
}

impl<'a> GlobalView<'a> {
    fn new(global: &'a Global, proxies: &'a HashMap<ProxyId, Proxy>) -> Self {
        Self {
            global,
            proxy: global.proxy.and_then(|p| proxies.get(&p)),
        }
    }

    pub fn id(&self) -> u32 {
        self.global.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.global.kind
    }

    pub fn permissions(&self) -> Permissions {
        self.global.permissions
    }

    /// Properties announced with the global.
    pub fn properties(&self) -> &'a PropertyBag {
        &self.global.properties
    }

    /// Snapshot of the announced properties that outlives the view.
    pub fn shared_properties(&self) -> Arc<PropertyBag> {
        Arc::clone(&self.global.properties)
    }

    pub fn proxy(&self) -> Option<&'a Proxy> {
        self.proxy
    }

    /// Active features of the bound proxy; empty when unbound.
    pub fn features(&self) -> Features {
        self.proxy.map(Proxy::active).unwrap_or_default()
    }

    /// The proxy's native info, or the announced properties while no info is
    /// cached.
    pub fn native_properties(&self) -> &'a PropertyBag {
        self.proxy
            .and_then(Proxy::info)
            .unwrap_or(&self.global.properties)
    }

    /// Local attributes: `id`, `kind` and `permissions` (as `rwxm`).
    pub fn attributes(&self) -> PropertyBag {
        let mut attrs = PropertyBag::new();
        attrs.set("id", self.global.id.to_string());
        attrs.set("kind", self.global.kind.as_str());
        attrs.set("permissions", self.global.permissions.to_rwxm());
        attrs
    }

    fn matches_any(&self, interests: &[Interest]) -> bool {
        let attributes = self.attributes();
        let sources = PropertySources {
            attributes: Some(&attributes),
            native: Some(self.native_properties()),
            global: Some(self.properties()),
        };
        interests
            .iter()
            .any(|i| i.matches(self.global.kind.into(), &sources))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

type Callback = Box<dyn FnOnce(Result<Features, ActivationError>)>;

enum Completion {
    Callback(Callback),
    Watcher { watcher: WatcherId, global: u32 },
}

struct Pending {
    proxy: ProxyId,
    completion: Completion,
}

struct WatcherSlot {
    id: WatcherId,
    interests: Vec<Interest>,
    target: Features,
    watcher: Box<dyn Watcher>,
    matched: BTreeSet<u32>,
    removed: bool,
}

enum Notice {
    Added,
    Updated,
}

fn inconsistency(id: u32, details: impl Into<String>) -> ConduitError {
    let err = ConduitError::ProtocolInconsistency {
        id,
        details: details.into(),
    };
    error!(error = %err, "protocol inconsistency, event skipped");
    err
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

pub struct Registry {
    transport: Box<dyn Transport>,
    globals: BTreeMap<u32, Global>,
    proxies: HashMap<ProxyId, Proxy>,
    handles: HashMap<ProxyHandle, ProxyId>,
    watchers: Vec<WatcherSlot>,
    pending: HashMap<TransitionId, Pending>,
    deferred: VecDeque<Command>,
    next_proxy: u64,
    next_transition: u64,
    next_watcher: u64,
}

impl Registry {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            globals: BTreeMap::new(),
            proxies: HashMap::new(),
            handles: HashMap::new(),
            watchers: Vec::new(),
            pending: HashMap::new(),
            deferred: VecDeque::new(),
            next_proxy: 1,
            next_transition: 1,
            next_watcher: 1,
        }
    }

    // ------------------------------------------------------------------ events

    /// Apply one transport event and finish its dispatch pass.
    ///
    /// Inconsistent events are logged and returned as errors; the registry
    /// stays usable either way.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<(), ConduitError> {
        let result = self.dispatch(event);
        self.finish();
        result
    }

    fn dispatch(&mut self, event: TransportEvent) -> Result<(), ConduitError> {
        match event {
            TransportEvent::GlobalAppeared {
                id,
                kind,
                permissions,
                properties,
            } => self.global_appeared(id, kind, permissions, properties),
            TransportEvent::GlobalUpdated {
                id,
                permissions,
                properties,
            } => self.global_updated(id, permissions, properties),
            TransportEvent::GlobalRemoved { id } => {
                self.global_removed(id);
                Ok(())
            }
            TransportEvent::Proxy { handle, event } => self.proxy_event(handle, event),
        }
    }

    fn global_appeared(
        &mut self,
        id: u32,
        kind: ObjectKind,
        permissions: Permissions,
        properties: PropertyBag,
    ) -> Result<(), ConduitError> {
        if self.globals.contains_key(&id) {
            return Err(inconsistency(id, "global appeared twice"));
        }

        // A local object the server already told us about.
        let local = self
            .proxies
            .values()
            .find(|p| p.bound_id() == Some(id) && p.attached().is_none() && matches!(p.origin(), Origin::Local(_)))
            .map(Proxy::id);
        if let Some(p) = local.and_then(|pid| self.proxies.get_mut(&pid)) {
            p.set_attached(Some(id));
        }

        self.globals.insert(
            id,
            Global {
                id,
                kind,
                permissions,
                properties: Arc::new(properties),
                proxy: local,
            },
        );
        debug!(id, %kind, local = local.is_some(), "global appeared");

        self.evaluate_all(id);
        Ok(())
    }

    fn global_updated(
        &mut self,
        id: u32,
        permissions: Option<Permissions>,
        properties: PropertyBag,
    ) -> Result<(), ConduitError> {
        let Some(global) = self.globals.get_mut(&id) else {
            return Err(inconsistency(id, "update for unknown global"));
        };
        global.properties = Arc::new(properties);
        if let Some(permissions) = permissions {
            global.permissions = permissions;
        }
        debug!(id, "global updated");

        self.evaluate_all(id);
        Ok(())
    }

    fn global_removed(&mut self, id: u32) {
        let Some(global) = self.globals.get(&id) else {
            debug!(id, "removal of unknown global ignored");
            return;
        };
        let proxy = global.proxy;

        for idx in 0..self.watchers.len() {
            if !self.watchers[idx].removed && self.watchers[idx].matched.remove(&id) {
                self.notify_removed(idx, id);
            }
        }
        if let Some(pid) = proxy {
            self.dispose(pid, true);
        }
        self.globals.remove(&id);
        debug!(id, "global removed");
    }

    fn proxy_event(&mut self, handle: ProxyHandle, event: ProxyEvent) -> Result<(), ConduitError> {
        let Some(&pid) = self.handles.get(&handle) else {
            return Err(inconsistency(handle.0, format!("event for unknown {handle}")));
        };

        match event {
            ProxyEvent::Removed => {
                self.dispose(pid, false);
            }
            ProxyEvent::Error { message } => {
                warn!(proxy = %pid, %handle, message = %message, "server reported a proxy error");
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    let finished = activation::fail_all(proxy, ActivationError::Transport(message));
                    self.deliver(finished);
                }
            }
            event => {
                let Some(proxy) = self.proxies.get_mut(&pid) else {
                    return Ok(());
                };
                let absorbed = proxy.absorb(&event);
                proxy.add_active(absorbed.gained);
                let mut attached = proxy.attached();
                let mut changed = absorbed.changed;

                if let ProxyEvent::Bound { global_id } = event
                    && attached.is_none()
                {
                    attached = self.attach_local(pid, global_id);
                    changed |= attached.is_some();
                }
                if changed && let Some(global) = attached {
                    self.evaluate_all(global);
                }
                self.advance(pid);
            }
        }
        Ok(())
    }

    fn attach_local(&mut self, pid: ProxyId, global_id: u32) -> Option<u32> {
        let global = self.globals.get_mut(&global_id)?;
        if let Some(other) = global.proxy {
            warn!(global = global_id, proxy = %pid, %other, "global already has a proxy, not attaching");
            return None;
        }
        global.proxy = Some(pid);
        if let Some(p) = self.proxies.get_mut(&pid) {
            p.set_attached(Some(global_id));
        }
        debug!(global = global_id, proxy = %pid, "local object attached to its global");
        Some(global_id)
    }

    // ------------------------------------------------------------------ watchers

    /// Register `watcher` for objects matching any of `interests`.
    ///
    /// Every live global that already matches is replayed as `on_added`, in
    /// ascending id order, before this returns. With a non-empty `target`
    /// each matching global is also bound and activated up to `target`.
    pub fn register_watcher(
        &mut self,
        interests: Vec<Interest>,
        target: Features,
        watcher: impl Watcher + 'static,
    ) -> Result<WatcherId, ConduitError> {
        for interest in &interests {
            interest.validate()?;
        }

        let id = WatcherId(self.next_watcher);
        self.next_watcher += 1;
        info!(watcher = %id, interests = interests.len(), ?target, "watcher registered");

        self.watchers.push(WatcherSlot {
            id,
            interests,
            target,
            watcher: Box::new(watcher),
            matched: BTreeSet::new(),
            removed: false,
        });
        let idx = self.watchers.len() - 1;
        let ids: Vec<u32> = self.globals.keys().copied().collect();
        for gid in ids {
            self.evaluate(idx, gid);
        }
        self.finish();
        Ok(id)
    }

    /// Remove a watcher. Each of its outstanding activations is reported to
    /// it once as [`ActivationError::Disposed`] before it is dropped.
    pub fn deregister_watcher(&mut self, id: WatcherId) -> bool {
        let found = self.mark_removed(id);
        self.finish();
        found
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.iter().filter(|w| !w.removed).count()
    }

    fn watcher_index(&self, id: WatcherId) -> Option<usize> {
        self.watchers.iter().position(|w| w.id == id && !w.removed)
    }

    fn mark_removed(&mut self, id: WatcherId) -> bool {
        let Some(idx) = self.watcher_index(id) else {
            return false;
        };
        self.watchers[idx].removed = true;
        info!(watcher = %id, "watcher deregistered");

        let mut outstanding: Vec<TransitionId> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.completion, Completion::Watcher { watcher, .. } if watcher == id))
            .map(|(tid, _)| *tid)
            .collect();
        outstanding.sort();

        // The slot lives until `finish`, so it still hears each failure once.
        for tid in outstanding {
            let Some(pending) = self.pending.remove(&tid) else {
                continue;
            };
            if let Some(proxy) = self.proxies.get_mut(&pending.proxy) {
                proxy.cancel_transition(tid);
            }
            if let Completion::Watcher { global, .. } = pending.completion {
                debug!(watcher = %id, global, "failing activation of deregistered watcher");
                let mut cx = WatcherContext::new(id);
                self.watchers[idx]
                    .watcher
                    .on_ready(&mut cx, global, Err(ActivationError::Disposed));
                self.apply(cx);
            }
        }
        true
    }

    fn evaluate_all(&mut self, id: u32) {
        for idx in 0..self.watchers.len() {
            self.evaluate(idx, id);
        }
    }

    /// Re-evaluate watcher `idx` against global `id` from scratch.
    fn evaluate(&mut self, idx: usize, id: u32) {
        if self.watchers[idx].removed {
            return;
        }
        let now = self
            .globals
            .get(&id)
            .is_some_and(|g| GlobalView::new(g, &self.proxies).matches_any(&self.watchers[idx].interests));
        let was = self.watchers[idx].matched.contains(&id);

        match (was, now) {
            (false, true) => {
                self.watchers[idx].matched.insert(id);
                self.notify(idx, id, Notice::Added);
                let slot = &self.watchers[idx];
                if !slot.removed && !slot.target.is_empty() {
                    let (watcher, target) = (slot.id, slot.target);
                    self.activate_for(watcher, id, target);
                }
            }
            (true, true) => self.notify(idx, id, Notice::Updated),
            (true, false) => {
                self.watchers[idx].matched.remove(&id);
                self.notify_removed(idx, id);
            }
            (false, false) => {}
        }
    }

    fn notify(&mut self, idx: usize, id: u32, notice: Notice) {
        let mut cx = WatcherContext::new(self.watchers[idx].id);
        {
            let Some(global) = self.globals.get(&id) else {
                return;
            };
            let view = GlobalView::new(global, &self.proxies);
            let watcher = &mut self.watchers[idx].watcher;
            match notice {
                Notice::Added => watcher.on_added(&mut cx, &view),
                Notice::Updated => watcher.on_updated(&mut cx, &view),
            }
        }
        self.apply(cx);
    }

    fn notify_removed(&mut self, idx: usize, id: u32) {
        let mut cx = WatcherContext::new(self.watchers[idx].id);
        self.watchers[idx].watcher.on_removed(&mut cx, id);
        self.apply(cx);
    }

    fn apply(&mut self, cx: WatcherContext) {
        for command in cx.into_commands() {
            match command {
                Command::Deregister(id) => {
                    self.mark_removed(id);
                }
                activate @ Command::Activate { .. } => self.deferred.push_back(activate),
            }
        }
    }

    /// Run deferred commands and synchronous transport replies until both
    /// are exhausted, then erase deregistered watchers.
    fn finish(&mut self) {
        loop {
            if let Some(command) = self.deferred.pop_front() {
                match command {
                    Command::Activate {
                        watcher,
                        global,
                        features,
                    } => {
                        if self.watcher_index(watcher).is_some() {
                            self.activate_for(watcher, global, features);
                        }
                    }
                    Command::Deregister(id) => {
                        self.mark_removed(id);
                    }
                }
                continue;
            }
            match self.transport.poll_reply() {
                Some(event) => {
                    // Already logged.
                    let _ = self.dispatch(event);
                }
                None => break,
            }
        }
        self.watchers.retain(|w| !w.removed);
    }

    // ------------------------------------------------------------------ proxies

    /// The proxy of global `global_id`, binding one if needed.
    ///
    /// A failed transport bind leaves the global untouched and returns
    /// [`ConduitError::Activation`].
    pub fn bind(&mut self, global_id: u32) -> Result<ProxyId, ConduitError> {
        let result = self.bind_inner(global_id);
        self.finish();
        result
    }

    fn bind_inner(&mut self, global_id: u32) -> Result<ProxyId, ConduitError> {
        let Some(global) = self.globals.get(&global_id) else {
            return Err(ConduitError::UnknownObject(format!("global {global_id}")));
        };
        if let Some(pid) = global.proxy {
            return Ok(pid);
        }
        let kind = global.kind;

        let handle = self
            .transport
            .bind(global_id, kind)
            .map_err(|e| ActivationError::Transport(e.to_string()))?;

        let pid = self.allocate_proxy();
        let mut proxy = Proxy::for_global(pid, kind, global_id, handle);
        proxy.set_attached(Some(global_id));
        self.proxies.insert(pid, proxy);
        self.handles.insert(handle, pid);
        if let Some(global) = self.globals.get_mut(&global_id) {
            global.proxy = Some(pid);
        }
        debug!(global = global_id, proxy = %pid, %handle, "global bound");
        Ok(pid)
    }

    /// Create a local object. It is exported by the `Bind` step of its first
    /// activation.
    pub fn create_local(&mut self, kind: ObjectKind, properties: PropertyBag) -> ProxyId {
        let pid = self.allocate_proxy();
        self.proxies.insert(pid, Proxy::local(pid, kind, properties));
        debug!(proxy = %pid, %kind, "local object created");
        pid
    }

    fn allocate_proxy(&mut self) -> ProxyId {
        let pid = ProxyId(self.next_proxy);
        self.next_proxy += 1;
        pid
    }

    /// Bring `proxy` up to `target` and report the outcome to `completion`,
    /// exactly once. Synchronous when `target` is already active.
    pub fn request_activation<F>(&mut self, proxy: ProxyId, target: Features, completion: F)
    where
        F: FnOnce(Result<Features, ActivationError>) + 'static,
    {
        self.start(proxy, target, Completion::Callback(Box::new(completion)));
        self.finish();
    }

    /// Release the state behind `features` on `proxy`, highest level first.
    pub fn deactivate(&mut self, proxy: ProxyId, features: Features) {
        let Some(p) = self.proxies.get_mut(&proxy) else {
            return;
        };
        let handle = p.handle();
        policy::deactivate(p.kind(), p, features);
        if let Some(handle) = handle
            && p.handle().is_none()
        {
            self.handles.remove(&handle);
            if let Err(e) = self.transport.call_method(handle, Request::Destroy) {
                warn!(proxy = %proxy, error = %e, "failed to release proxy handle");
            }
        }
        self.advance(proxy);
        self.finish();
    }

    /// Destroy a proxy: fail its transitions with `Disposed`, deactivate
    /// everything and detach it from its global.
    pub fn destroy_proxy(&mut self, proxy: ProxyId) -> bool {
        let found = self.dispose(proxy, true);
        self.finish();
        found
    }

    fn activate_for(&mut self, watcher: WatcherId, global: u32, target: Features) {
        let completion = Completion::Watcher { watcher, global };
        match self.bind_inner(global) {
            Ok(pid) => self.start(pid, target, completion),
            Err(e) => {
                warn!(watcher = %watcher, global, error = %e, "cannot bind global for activation");
                let err = match e {
                    ConduitError::Activation(err) => err,
                    _ => ActivationError::UnknownObject,
                };
                self.complete(completion, Err(err));
            }
        }
    }

    fn start(&mut self, pid: ProxyId, target: Features, completion: Completion) {
        let Some(proxy) = self.proxies.get_mut(&pid) else {
            self.complete(completion, Err(ActivationError::UnknownObject));
            return;
        };
        if (target - proxy.active()).is_empty() {
            let active = proxy.active();
            self.complete(completion, Ok(active));
            return;
        }

        let tid = TransitionId(self.next_transition);
        self.next_transition += 1;
        proxy.start_transition(tid, target);
        self.pending.insert(tid, Pending { proxy: pid, completion });
        self.advance(pid);
    }

    fn advance(&mut self, pid: ProxyId) {
        let Some(proxy) = self.proxies.get_mut(&pid) else {
            return;
        };
        let before = proxy.handle();
        let finished = activation::advance(proxy, self.transport.as_mut());
        let after = proxy.handle();
        if before != after {
            if let Some(h) = before {
                self.handles.remove(&h);
            }
            if let Some(h) = after {
                self.handles.insert(h, pid);
            }
        }
        self.deliver(finished);
    }

    fn dispose(&mut self, pid: ProxyId, release: bool) -> bool {
        let Some(mut proxy) = self.proxies.remove(&pid) else {
            return false;
        };
        if let Some(handle) = proxy.handle() {
            self.handles.remove(&handle);
            if release && let Err(e) = self.transport.call_method(handle, Request::Destroy) {
                warn!(proxy = %pid, error = %e, "failed to release proxy handle");
            }
        }
        if let Some(global) = proxy.attached().and_then(|g| self.globals.get_mut(&g))
            && global.proxy == Some(pid)
        {
            global.proxy = None;
        }

        let finished = activation::fail_all(&mut proxy, ActivationError::Disposed);
        let (kind, active) = (proxy.kind(), proxy.active());
        policy::deactivate(kind, &mut proxy, active);
        debug!(proxy = %pid, failed = finished.len(), "proxy disposed");
        self.deliver(finished);
        true
    }

    fn deliver(&mut self, finished: Vec<Finished>) {
        for (tid, result) in finished {
            if let Some(pending) = self.pending.remove(&tid) {
                self.complete(pending.completion, result);
            }
        }
    }

    fn complete(&mut self, completion: Completion, result: Result<Features, ActivationError>) {
        match completion {
            Completion::Callback(callback) => callback(result),
            Completion::Watcher { watcher, global } => {
                let Some(idx) = self.watcher_index(watcher) else {
                    return;
                };
                let mut cx = WatcherContext::new(watcher);
                {
                    let slot = &mut self.watchers[idx].watcher;
                    match (result, self.globals.get(&global)) {
                        (Ok(_), Some(g)) => {
                            let view = GlobalView::new(g, &self.proxies);
                            slot.on_ready(&mut cx, global, Ok(&view));
                        }
                        (Ok(_), None) => slot.on_ready(&mut cx, global, Err(ActivationError::Disposed)),
                        (Err(e), _) => slot.on_ready(&mut cx, global, Err(e)),
                    }
                }
                self.apply(cx);
            }
        }
    }

    // ------------------------------------------------------------------ queries

    pub fn global(&self, id: u32) -> Option<GlobalView<'_>> {
        self.globals.get(&id).map(|g| GlobalView::new(g, &self.proxies))
    }

    /// Every live global, in ascending id order.
    pub fn globals(&self) -> impl Iterator<Item = GlobalView<'_>> {
        self.globals.values().map(|g| GlobalView::new(g, &self.proxies))
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies.get(&id)
    }

    /// Ids of live globals matching `interest`, ascending.
    pub fn lookup(&self, interest: &Interest) -> Vec<u32> {
        self.globals()
            .filter(|view| view.matches_any(std::slice::from_ref(interest)))
            .map(|view| view.id())
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("globals", &self.globals.len())
            .field("proxies", &self.proxies.len())
            .field("watchers", &self.watcher_count())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use conduit_kernel::interest::{Domain, Verb};
    use conduit_middleware::{Call, LoopbackTransport};
    use conduit_types::{Category, ParamKind};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Added(u32),
        Updated(u32),
        Removed(u32),
        Ready(u32, Result<Features, ActivationError>),
    }

    type Log = Rc<RefCell<Vec<Seen>>>;

    #[derive(Default)]
    struct Recorder {
        log: Log,
        deregister_on_added: Option<Option<WatcherId>>,
        activate_on_added: Option<Features>,
    }

    impl Recorder {
        fn new(log: &Log) -> Self {
            Self {
                log: Rc::clone(log),
                ..Self::default()
            }
        }
    }

    impl Watcher for Recorder {
        fn on_added(&mut self, cx: &mut WatcherContext, global: &GlobalView<'_>) {
            self.log.borrow_mut().push(Seen::Added(global.id()));
            match self.deregister_on_added {
                Some(None) => cx.deregister(),
                Some(Some(other)) => cx.deregister_watcher(other),
                None => {}
            }
            if let Some(features) = self.activate_on_added {
                cx.request_activation(global.id(), features);
            }
        }

        fn on_removed(&mut self, _cx: &mut WatcherContext, id: u32) {
            self.log.borrow_mut().push(Seen::Removed(id));
        }

        fn on_updated(&mut self, _cx: &mut WatcherContext, global: &GlobalView<'_>) {
            self.log.borrow_mut().push(Seen::Updated(global.id()));
        }

        fn on_ready(&mut self, _cx: &mut WatcherContext, id: u32, result: Result<&GlobalView<'_>, ActivationError>) {
            self.log
                .borrow_mut()
                .push(Seen::Ready(id, result.map(|view| view.features())));
        }
    }

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn appeared(id: u32, kind: ObjectKind, props: &[(&str, &str)]) -> TransportEvent {
        TransportEvent::GlobalAppeared {
            id,
            kind,
            permissions: Permissions::all(),
            properties: props.iter().copied().collect(),
        }
    }

    fn updated(id: u32, props: &[(&str, &str)]) -> TransportEvent {
        TransportEvent::GlobalUpdated {
            id,
            permissions: None,
            properties: props.iter().copied().collect(),
        }
    }

    fn on_proxy(handle: ProxyHandle, event: ProxyEvent) -> TransportEvent {
        TransportEvent::Proxy { handle, event }
    }

    fn nodes() -> Interest {
        Interest::new(ObjectKind::Node)
    }

    fn sinks() -> Interest {
        Interest::builder(ObjectKind::Node)
            .constrain(Domain::GlobalProperty, "media.class", Verb::Equals, "Audio/Sink")
            .build()
            .unwrap()
    }

    fn setup() -> (Registry, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        (Registry::new(transport.clone()), transport)
    }

    // ------------------------------------------------------------------ registration

    #[test]
    fn registration_replays_live_matches_in_id_order() {
        let (mut reg, _) = setup();
        reg.handle_event(appeared(12, ObjectKind::Node, &[])).unwrap();
        reg.handle_event(appeared(5, ObjectKind::Node, &[])).unwrap();
        reg.handle_event(appeared(7, ObjectKind::Device, &[])).unwrap();

        let seen = log();
        reg.register_watcher(vec![nodes()], Features::empty(), Recorder::new(&seen))
            .unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(5), Seen::Added(12)]);

        reg.handle_event(appeared(20, ObjectKind::Node, &[])).unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(5), Seen::Added(12), Seen::Added(20)]);
    }

    #[test]
    fn invalid_interest_is_rejected() {
        let (mut reg, _) = setup();
        let mut bad = Interest::new(Category::Any);
        bad.add_constraint(conduit_kernel::Constraint::new(
            Domain::GlobalProperty,
            "x",
            Verb::InRange,
            Some("5".into()),
        ));
        let result = reg.register_watcher(vec![bad], Features::empty(), Recorder::new(&log()));
        assert!(matches!(result, Err(ConduitError::ConstraintInvalid(_))));
        assert_eq!(reg.watcher_count(), 0);
    }

    // ------------------------------------------------------------------ events

    #[test]
    fn removal_of_unknown_global_is_silent() {
        let (mut reg, _) = setup();
        let seen = log();
        reg.register_watcher(vec![Interest::new(Category::Any)], Features::empty(), Recorder::new(&seen))
            .unwrap();
        assert!(reg.handle_event(TransportEvent::GlobalRemoved { id: 99 }).is_ok());
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn duplicate_global_is_an_inconsistency() {
        let (mut reg, _) = setup();
        reg.handle_event(appeared(3, ObjectKind::Node, &[("a", "1")])).unwrap();
        let err = reg.handle_event(appeared(3, ObjectKind::Device, &[])).unwrap_err();
        assert!(matches!(err, ConduitError::ProtocolInconsistency { id: 3, .. }));
        assert_eq!(reg.global(3).map(|g| g.kind()), Some(ObjectKind::Node));
    }

    #[test]
    fn update_of_unknown_global_is_an_inconsistency() {
        let (mut reg, _) = setup();
        assert!(matches!(
            reg.handle_event(updated(8, &[])),
            Err(ConduitError::ProtocolInconsistency { id: 8, .. })
        ));
    }

    #[test]
    fn event_for_unknown_handle_is_an_inconsistency() {
        let (mut reg, _) = setup();
        assert!(reg.handle_event(on_proxy(ProxyHandle(77), ProxyEvent::Done)).is_err());
    }

    #[test]
    fn update_synthesizes_added_updated_and_removed() {
        let (mut reg, _) = setup();
        let seen = log();
        reg.register_watcher(vec![sinks()], Features::empty(), Recorder::new(&seen))
            .unwrap();

        reg.handle_event(appeared(4, ObjectKind::Node, &[("media.class", "Audio/Source")]))
            .unwrap();
        reg.handle_event(updated(4, &[("media.class", "Audio/Sink")])).unwrap();
        reg.handle_event(updated(4, &[("media.class", "Audio/Sink"), ("x", "1")]))
            .unwrap();
        reg.handle_event(updated(4, &[("media.class", "Video/Sink")])).unwrap();
        reg.handle_event(TransportEvent::GlobalRemoved { id: 4 }).unwrap();

        assert_eq!(*seen.borrow(), [Seen::Added(4), Seen::Updated(4), Seen::Removed(4)]);
    }

    #[test]
    fn permissions_update_is_visible_to_attribute_interests() {
        let (mut reg, _) = setup();
        let seen = log();
        let writable = Interest::builder(Category::Any)
            .constrain(Domain::Attribute, "permissions", Verb::Matches, "?w*")
            .build()
            .unwrap();
        reg.register_watcher(vec![writable], Features::empty(), Recorder::new(&seen))
            .unwrap();
        reg.handle_event(TransportEvent::GlobalAppeared {
            id: 2,
            kind: ObjectKind::Client,
            permissions: Permissions::R,
            properties: PropertyBag::new(),
        })
        .unwrap();
        assert!(seen.borrow().is_empty());

        reg.handle_event(TransportEvent::GlobalUpdated {
            id: 2,
            permissions: Some(Permissions::R | Permissions::W),
            properties: PropertyBag::new(),
        })
        .unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(2)]);
    }

    #[test]
    fn lookup_returns_matching_ids() {
        let (mut reg, _) = setup();
        reg.handle_event(appeared(1, ObjectKind::Node, &[("media.class", "Audio/Sink")]))
            .unwrap();
        reg.handle_event(appeared(2, ObjectKind::Node, &[("media.class", "Audio/Source")]))
            .unwrap();
        reg.handle_event(appeared(3, ObjectKind::Node, &[("media.class", "Audio/Sink")]))
            .unwrap();
        assert_eq!(reg.lookup(&sinks()), [1, 3]);
        assert_eq!(reg.global_count(), 3);
    }

    // ------------------------------------------------------------------ deregistration

    #[test]
    fn deregistered_watcher_gets_nothing_more_in_the_pass() {
        let (mut reg, _) = setup();
        let first_log = log();
        let second_log = log();

        // The second watcher gets id 2.
        let first = Recorder {
            deregister_on_added: Some(Some(WatcherId(2))),
            ..Recorder::new(&first_log)
        };
        reg.register_watcher(vec![nodes()], Features::empty(), first).unwrap();
        let second = reg
            .register_watcher(vec![nodes()], Features::empty(), Recorder::new(&second_log))
            .unwrap();
        assert_eq!(second, WatcherId(2));

        reg.handle_event(appeared(9, ObjectKind::Node, &[])).unwrap();
        assert_eq!(*first_log.borrow(), [Seen::Added(9)]);
        assert!(second_log.borrow().is_empty());
        assert_eq!(reg.watcher_count(), 1);
        assert!(!reg.deregister_watcher(second));
    }

    #[test]
    fn self_deregistration_stops_future_notifications() {
        let (mut reg, _) = setup();
        let seen = log();
        let watcher = Recorder {
            deregister_on_added: Some(None),
            ..Recorder::new(&seen)
        };
        reg.register_watcher(vec![nodes()], Features::empty(), watcher).unwrap();
        reg.handle_event(appeared(1, ObjectKind::Node, &[])).unwrap();
        reg.handle_event(appeared(2, ObjectKind::Node, &[])).unwrap();
        reg.handle_event(TransportEvent::GlobalRemoved { id: 1 }).unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(1)]);
        assert_eq!(reg.watcher_count(), 0);
    }

    #[test]
    fn deregistration_fails_outstanding_activations_once() {
        let (mut reg, _) = setup();
        let seen = log();
        let id = reg
            .register_watcher(vec![nodes()], Features::STANDARD, Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(6, ObjectKind::Node, &[])).unwrap();
        let pid = reg.global(6).and_then(|g| g.proxy()).map(Proxy::id).unwrap();
        assert_eq!(reg.proxy(pid).unwrap().transitions().len(), 1);

        assert!(reg.deregister_watcher(id));
        assert!(reg.proxy(pid).unwrap().transitions().is_empty());
        assert_eq!(reg.watcher_count(), 0);
        assert_eq!(
            *seen.borrow(),
            [Seen::Added(6), Seen::Ready(6, Err(ActivationError::Disposed))]
        );

        reg.handle_event(TransportEvent::GlobalRemoved { id: 6 }).unwrap();
        assert_eq!(seen.borrow().len(), 2, "nothing after deregistration completes");
    }

    // ------------------------------------------------------------------ activation

    #[test]
    fn watcher_target_binds_and_reports_ready() {
        let (mut reg, transport) = setup();
        let seen = log();
        reg.register_watcher(vec![nodes()], Features::STANDARD, Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(40, ObjectKind::Node, &[])).unwrap();

        let handle = transport.handle_for(40).unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(40)]);

        reg.handle_event(on_proxy(
            handle,
            ProxyEvent::Info {
                properties: [("node.name", "n")].into_iter().collect(),
            },
        ))
        .unwrap();
        assert_eq!(
            *seen.borrow(),
            [
                Seen::Added(40),
                Seen::Updated(40),
                Seen::Ready(40, Ok(Features::STANDARD)),
            ]
        );
    }

    #[test]
    fn satisfied_target_completes_synchronously_without_transition() {
        let (mut reg, _) = setup();
        reg.handle_event(appeared(1, ObjectKind::Node, &[])).unwrap();
        let pid = reg.bind(1).unwrap();
        assert_eq!(reg.bind(1).unwrap(), pid, "bind is idempotent");

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        reg.request_activation(pid, Features::MINIMAL, move |r| *sink.borrow_mut() = Some(r));

        assert_eq!(*result.borrow(), Some(Ok(Features::MINIMAL)));
        assert!(reg.proxy(pid).unwrap().transitions().is_empty());
    }

    #[test]
    fn destroying_a_proxy_fails_its_transition_once() {
        let (mut reg, transport) = setup();
        reg.handle_event(appeared(1, ObjectKind::Device, &[])).unwrap();
        let pid = reg.bind(1).unwrap();
        let handle = transport.handle_for(1).unwrap();

        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        reg.request_activation(pid, Features::MINIMAL | Features::PARAM_ROUTE, move |r| {
            sink.borrow_mut().push(r)
        });
        assert!(results.borrow().is_empty());

        assert!(reg.destroy_proxy(pid));
        assert!(!reg.destroy_proxy(pid));
        assert_eq!(*results.borrow(), [Err(ActivationError::Disposed)]);
        assert!(reg.global(1).unwrap().proxy().is_none());
        assert_eq!(
            transport.requests_for(handle),
            [Request::EnumParams(ParamKind::Route), Request::Destroy]
        );

        // The late reply no longer has a proxy to go to.
        let late = on_proxy(
            handle,
            ProxyEvent::Params {
                param: ParamKind::Route,
                values: vec![],
            },
        );
        assert!(reg.handle_event(late).is_err());
        assert_eq!(results.borrow().len(), 1);
    }

    #[test]
    fn global_removal_notifies_then_disposes() {
        let (mut reg, transport) = setup();
        let seen = log();
        reg.register_watcher(vec![nodes()], Features::STANDARD, Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(40, ObjectKind::Node, &[])).unwrap();
        let handle = transport.handle_for(40).unwrap();

        reg.handle_event(TransportEvent::GlobalRemoved { id: 40 }).unwrap();
        assert_eq!(
            *seen.borrow(),
            [
                Seen::Added(40),
                Seen::Removed(40),
                Seen::Ready(40, Err(ActivationError::Disposed)),
            ]
        );
        assert!(reg.global(40).is_none());
        assert_eq!(transport.requests_for(handle), [Request::Destroy]);
    }

    #[test]
    fn server_side_proxy_removal_fails_transitions_without_destroy() {
        let (mut reg, transport) = setup();
        reg.handle_event(appeared(1, ObjectKind::Device, &[])).unwrap();
        let pid = reg.bind(1).unwrap();
        let handle = transport.handle_for(1).unwrap();

        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        reg.request_activation(pid, Features::MINIMAL | Features::PARAM_ROUTE, move |r| {
            sink.borrow_mut().push(r)
        });
        assert!(results.borrow().is_empty());

        reg.handle_event(on_proxy(handle, ProxyEvent::Removed)).unwrap();
        assert_eq!(*results.borrow(), [Err(ActivationError::Disposed)]);
        assert!(reg.proxy(pid).is_none());
        assert!(reg.global(1).unwrap().proxy().is_none(), "proxy detached from its global");
        assert_eq!(
            transport.requests_for(handle),
            [Request::EnumParams(ParamKind::Route)],
            "the server already dropped it, so no Destroy is sent"
        );

        // The handle is gone; a rebind gets a fresh proxy.
        assert!(reg.handle_event(on_proxy(handle, ProxyEvent::Removed)).is_err());
        assert_ne!(reg.bind(1).unwrap(), pid);
    }

    #[test]
    fn proxy_error_fails_transitions_with_transport_error() {
        let (mut reg, transport) = setup();
        let seen = log();
        reg.register_watcher(vec![nodes()], Features::STANDARD, Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(40, ObjectKind::Node, &[])).unwrap();
        let handle = transport.handle_for(40).unwrap();

        reg.handle_event(on_proxy(
            handle,
            ProxyEvent::Error {
                message: "no such object".into(),
            },
        ))
        .unwrap();
        assert_eq!(
            seen.borrow().last(),
            Some(&Seen::Ready(40, Err(ActivationError::Transport("no such object".into()))))
        );
        assert!(reg.global(40).unwrap().proxy().is_some(), "the proxy survives");
    }

    #[test]
    fn failed_bind_reports_to_watcher_and_leaves_global_untouched() {
        let (mut reg, transport) = setup();
        transport.refuse_bind(40);
        let seen = log();
        reg.register_watcher(vec![nodes()], Features::STANDARD, Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(40, ObjectKind::Node, &[])).unwrap();

        assert!(matches!(
            seen.borrow().last(),
            Some(Seen::Ready(40, Err(ActivationError::Transport(_))))
        ));
        assert!(reg.global(40).unwrap().proxy().is_none());
        assert!(matches!(
            reg.bind(40),
            Err(ConduitError::Activation(ActivationError::Transport(_)))
        ));
    }

    #[test]
    fn activation_from_callback_runs_after_the_pass() {
        let (mut reg, transport) = setup();
        let seen = log();
        let watcher = Recorder {
            activate_on_added: Some(Features::MINIMAL),
            ..Recorder::new(&seen)
        };
        reg.register_watcher(vec![nodes()], Features::empty(), watcher).unwrap();
        reg.handle_event(appeared(3, ObjectKind::Node, &[])).unwrap();

        assert!(matches!(transport.calls()[0], Call::Bind { global_id: 3, .. }));
        assert_eq!(*seen.borrow(), [Seen::Added(3), Seen::Ready(3, Ok(Features::MINIMAL))]);
    }

    #[test]
    fn native_interest_matches_once_info_arrives() {
        let (mut reg, transport) = setup();
        let seen = log();
        let native = Interest::builder(ObjectKind::Node)
            .constrain(Domain::NativeProperty, "node.nick", Verb::Equals, "Speakers")
            .build()
            .unwrap();
        reg.register_watcher(vec![native], Features::empty(), Recorder::new(&seen))
            .unwrap();
        reg.handle_event(appeared(8, ObjectKind::Node, &[("node.nick", "raw")]))
            .unwrap();
        assert!(seen.borrow().is_empty());

        reg.bind(8).unwrap();
        let handle = transport.handle_for(8).unwrap();
        reg.handle_event(on_proxy(
            handle,
            ProxyEvent::Info {
                properties: [("node.nick", "Speakers")].into_iter().collect(),
            },
        ))
        .unwrap();
        assert_eq!(*seen.borrow(), [Seen::Added(8)]);
    }

    #[test]
    fn local_object_is_exported_and_attached() {
        let transport = LoopbackTransport::with_auto_reply();
        let mut reg = Registry::new(transport.clone());
        let props: PropertyBag = [("endpoint.name", "virtual")].into_iter().collect();
        let pid = reg.create_local(ObjectKind::Endpoint, props);

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        reg.request_activation(pid, Features::STANDARD, move |r| *sink.borrow_mut() = Some(r));

        // Export and Bound happened synchronously through the loopback.
        assert_eq!(*result.borrow(), Some(Ok(Features::STANDARD)));
        let proxy = reg.proxy(pid).unwrap();
        let global_id = proxy.bound_id().unwrap();
        assert_eq!(proxy.info().and_then(|i| i.get("endpoint.name")), Some("virtual"));

        reg.handle_event(appeared(global_id, ObjectKind::Endpoint, &[])).unwrap();
        let view = reg.global(global_id).unwrap();
        assert_eq!(view.proxy().map(Proxy::id), Some(pid));
        assert_eq!(view.native_properties().get("endpoint.name"), Some("virtual"));
    }

    #[test]
    fn deactivate_releases_and_allows_rebind() {
        let (mut reg, transport) = setup();
        reg.handle_event(appeared(1, ObjectKind::Client, &[])).unwrap();
        let pid = reg.bind(1).unwrap();
        let first = transport.handle_for(1).unwrap();

        reg.deactivate(pid, Features::PROXY);
        assert!(reg.proxy(pid).unwrap().active().intersects(Features::BOUND));
        assert!(!reg.proxy(pid).unwrap().active().contains(Features::PROXY));
        assert_eq!(transport.requests_for(first), [Request::Destroy]);

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        reg.request_activation(pid, Features::MINIMAL, move |r| *sink.borrow_mut() = Some(r));
        assert_eq!(*result.borrow(), Some(Ok(Features::MINIMAL)));
        let second = transport.handle_for(1).unwrap();
        assert_ne!(first, second);
        reg.handle_event(on_proxy(second, ProxyEvent::Done)).unwrap();
    }
}
