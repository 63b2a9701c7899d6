//! In-memory [`Transport`] with no server behind it.
//!
//! Every call is recorded so tests can assert on what the core asked for.
//! With [`LoopbackTransport::with_auto_reply`] the loopback also plays the
//! server for requests whose answer does not depend on server state:
//!
//! | Call | Reply |
//! |---|---|
//! | `export` | `Bound { global_id }` with a fresh id |
//! | `EnumParams(p)` | `Params { param: p, values: [] }` |
//! | `Sync` | seeded metadata entries, then `Done` |
//! | `Destroy` | nothing |
//!
//! Handles are assigned sequentially starting at 1, in call order.
//!
//! The transport is a cheap handle: clones share the same call log, so a
//! test can keep one clone while the registry owns another.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use conduit_types::{ConduitError, ObjectKind, PropertyBag, ProxyEvent, ProxyHandle, TransportEvent};
use tracing::debug;

use crate::transport::{Request, Transport};

/// First global id handed out to exported objects.
pub const FIRST_EXPORTED_ID: u32 = 1000;

/// One recorded outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Bind {
        global_id: u32,
        kind: ObjectKind,
        handle: ProxyHandle,
    },
    Export {
        kind: ObjectKind,
        properties: PropertyBag,
        handle: ProxyHandle,
    },
    Method {
        handle: ProxyHandle,
        request: Request,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct SeededEntry {
    subject: u32,
    key: String,
    value_type: Option<String>,
    value: String,
}

#[derive(Debug)]
struct Inner {
    next_handle: u32,
    next_global: u32,
    auto_reply: bool,
    calls: Vec<Call>,
    bound: BTreeMap<ProxyHandle, u32>,
    refused_binds: BTreeSet<u32>,
    refuse_methods: bool,
    metadata: BTreeMap<u32, Vec<SeededEntry>>,
    replies: VecDeque<TransportEvent>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_handle: 1,
            next_global: FIRST_EXPORTED_ID,
            auto_reply: false,
            calls: Vec::new(),
            bound: BTreeMap::new(),
            refused_binds: BTreeSet::new(),
            refuse_methods: false,
            metadata: BTreeMap::new(),
            replies: VecDeque::new(),
        }
    }
}

impl Inner {
    fn allocate(&mut self) -> ProxyHandle {
        let handle = ProxyHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn reply(&mut self, handle: ProxyHandle, event: ProxyEvent) {
        if self.auto_reply {
            self.replies.push_back(TransportEvent::Proxy { handle, event });
        }
    }
}

/// Recording, optionally self-answering transport.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    inner: Rc<RefCell<Inner>>,
}

impl LoopbackTransport {
    /// Record calls only; no replies are produced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls and answer them as described in the module docs.
    pub fn with_auto_reply() -> Self {
        let transport = Self::default();
        transport.inner.borrow_mut().auto_reply = true;
        transport
    }

    /// Make every later `bind` of `global_id` fail.
    pub fn refuse_bind(&self, global_id: u32) {
        self.inner.borrow_mut().refused_binds.insert(global_id);
    }

    /// Make every later `call_method` fail.
    pub fn refuse_methods(&self, refuse: bool) {
        self.inner.borrow_mut().refuse_methods = refuse;
    }

    /// Entry the loopback reports for metadata global `global_id` when a
    /// bound proxy of it is synced.
    pub fn seed_metadata(
        &self,
        global_id: u32,
        subject: u32,
        key: impl Into<String>,
        value_type: Option<&str>,
        value: impl Into<String>,
    ) {
        self.inner
            .borrow_mut()
            .metadata
            .entry(global_id)
            .or_default()
            .push(SeededEntry {
                subject,
                key: key.into(),
                value_type: value_type.map(str::to_string),
                value: value.into(),
            });
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.borrow().calls.clone()
    }

    /// Requests sent to `handle`, oldest first.
    pub fn requests_for(&self, handle: ProxyHandle) -> Vec<Request> {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Method { handle: h, request } if *h == handle => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Handle of the most recent successful bind of `global_id`.
    pub fn handle_for(&self, global_id: u32) -> Option<ProxyHandle> {
        self.inner
            .borrow()
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                Call::Bind { global_id: g, handle, .. } if *g == global_id => Some(*handle),
                _ => None,
            })
    }
}

impl Transport for LoopbackTransport {
    fn bind(&mut self, global_id: u32, kind: ObjectKind) -> Result<ProxyHandle, ConduitError> {
        let mut inner = self.inner.borrow_mut();
        if inner.refused_binds.contains(&global_id) {
            return Err(ConduitError::Transport(format!("bind of global {global_id} refused")));
        }
        let handle = inner.allocate();
        inner.bound.insert(handle, global_id);
        inner.calls.push(Call::Bind {
            global_id,
            kind,
            handle,
        });
        debug!(global_id, %kind, %handle, "loopback bind");
        Ok(handle)
    }

    fn export(&mut self, kind: ObjectKind, properties: &PropertyBag) -> Result<ProxyHandle, ConduitError> {
        let mut inner = self.inner.borrow_mut();
        let handle = inner.allocate();
        inner.calls.push(Call::Export {
            kind,
            properties: properties.clone(),
            handle,
        });
        if inner.auto_reply {
            let global_id = inner.next_global;
            inner.next_global += 1;
            inner.bound.insert(handle, global_id);
            inner.reply(handle, ProxyEvent::Bound { global_id });
        }
        debug!(%kind, %handle, "loopback export");
        Ok(handle)
    }

    fn call_method(&mut self, handle: ProxyHandle, request: Request) -> Result<(), ConduitError> {
        let mut inner = self.inner.borrow_mut();
        if inner.refuse_methods {
            return Err(ConduitError::Transport(format!("{request:?} on {handle} refused")));
        }
        inner.calls.push(Call::Method { handle, request });
        match request {
            Request::EnumParams(param) => inner.reply(
                handle,
                ProxyEvent::Params {
                    param,
                    values: Vec::new(),
                },
            ),
            Request::Sync => {
                let seeded = inner
                    .bound
                    .get(&handle)
                    .and_then(|g| inner.metadata.get(g))
                    .cloned()
                    .unwrap_or_default();
                for entry in seeded {
                    inner.reply(
                        handle,
                        ProxyEvent::MetadataEntry {
                            subject: entry.subject,
                            key: entry.key,
                            value_type: entry.value_type,
                            value: Some(entry.value),
                        },
                    );
                }
                inner.reply(handle, ProxyEvent::Done);
            }
            Request::Destroy => {
                inner.bound.remove(&handle);
            }
        }
        Ok(())
    }

    fn poll_reply(&mut self) -> Option<TransportEvent> {
        self.inner.borrow_mut().replies.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::ParamKind;

    #[test]
    fn handles_are_sequential_and_calls_recorded() {
        let mut t = LoopbackTransport::new();
        let observer = t.clone();
        let a = t.bind(40, ObjectKind::Node).unwrap();
        let b = t.bind(41, ObjectKind::Device).unwrap();
        assert_eq!((a, b), (ProxyHandle(1), ProxyHandle(2)));
        t.call_method(a, Request::Sync).unwrap();

        assert_eq!(observer.calls().len(), 3);
        assert_eq!(observer.handle_for(41), Some(b));
        assert_eq!(observer.requests_for(a), [Request::Sync]);
        assert_eq!(t.poll_reply(), None, "silent loopback must not reply");
    }

    #[test]
    fn refused_bind_fails_without_recording() {
        let mut t = LoopbackTransport::new();
        t.refuse_bind(9);
        assert!(matches!(t.bind(9, ObjectKind::Node), Err(ConduitError::Transport(_))));
        assert!(t.calls().is_empty());
    }

    #[test]
    fn refused_methods_fail() {
        let mut t = LoopbackTransport::new();
        let h = t.bind(1, ObjectKind::Node).unwrap();
        t.refuse_methods(true);
        assert!(t.call_method(h, Request::Sync).is_err());
    }

    #[test]
    fn auto_reply_answers_enum_params_and_export() {
        let mut t = LoopbackTransport::with_auto_reply();
        let h = t.bind(5, ObjectKind::Device).unwrap();
        t.call_method(h, Request::EnumParams(ParamKind::Route)).unwrap();
        assert_eq!(
            t.poll_reply(),
            Some(TransportEvent::Proxy {
                handle: h,
                event: ProxyEvent::Params {
                    param: ParamKind::Route,
                    values: vec![],
                },
            })
        );

        let local = t.export(ObjectKind::Endpoint, &PropertyBag::new()).unwrap();
        assert_eq!(
            t.poll_reply(),
            Some(TransportEvent::Proxy {
                handle: local,
                event: ProxyEvent::Bound {
                    global_id: FIRST_EXPORTED_ID
                },
            })
        );
        assert_eq!(t.poll_reply(), None);
    }

    #[test]
    fn sync_replays_seeded_metadata_then_done() {
        let mut t = LoopbackTransport::with_auto_reply();
        t.seed_metadata(30, 0, "device.restore-profile", Some("Spa:String:JSON"), "true");
        let h = t.bind(30, ObjectKind::Metadata).unwrap();
        t.call_method(h, Request::Sync).unwrap();

        match t.poll_reply() {
            Some(TransportEvent::Proxy {
                event: ProxyEvent::MetadataEntry { key, value, .. },
                ..
            }) => {
                assert_eq!(key, "device.restore-profile");
                assert_eq!(value.as_deref(), Some("true"));
            }
            other => panic!("expected metadata entry, got {other:?}"),
        }
        assert_eq!(
            t.poll_reply(),
            Some(TransportEvent::Proxy {
                handle: h,
                event: ProxyEvent::Done,
            })
        );
    }
}
