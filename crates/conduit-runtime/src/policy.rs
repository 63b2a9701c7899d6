//! Per-kind activation behavior.
//!
//! Every [`ObjectKind`] has a fixed set of features it supports and a fixed
//! order in which missing features are brought up. The table is closed:
//! dispatch is a `match` on the kind, there is no registration.
//!
//! | Kind | Supported beyond `MINIMAL` |
//! |---|---|
//! | client, link, endpoint-link | `INFO` |
//! | device | `INFO`, `PARAM_PROPS`, `PARAM_PROFILE`, `PARAM_ROUTE` |
//! | node | `INFO`, `PARAM_PROPS`, `PARAM_FORMAT`, `PARAM_PORT_CONFIG` |
//! | port | `INFO`, `PARAM_FORMAT` |
//! | session | `INFO`, `PARAM_PROPS` |
//! | endpoint | `INFO`, `PARAM_PROPS`, `PARAM_ROUTE`, `CONTROLS` |
//! | metadata | `METADATA_DATA` |
//!
//! Step order: `Bind` → `CacheInfo` → `CacheParams` (lowest missing param
//! first) → `CacheControls` → `LoadMetadata`.

use conduit_middleware::{Request, Transport};
use conduit_types::{ActivationError, Features, ObjectKind, ParamKind};
use tracing::{debug, trace};

use crate::activation::{Origin, Proxy};

/// One unit of activation work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Create the transport handle and learn the global id.
    Bind,
    CacheInfo,
    CacheParams(ParamKind),
    /// Derive endpoint controls from the cached props parameter.
    CacheControls,
    LoadMetadata,
}

/// Result of executing a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step finished and these features are now active.
    Complete(Features),
    /// The step waits for an event from the server.
    Suspend,
}

pub fn supported_features(kind: ObjectKind) -> Features {
    let extra = match kind {
        ObjectKind::Client | ObjectKind::Link | ObjectKind::EndpointLink => Features::INFO,
        ObjectKind::Device => {
            Features::INFO | Features::PARAM_PROPS | Features::PARAM_PROFILE | Features::PARAM_ROUTE
        }
        ObjectKind::Node => {
            Features::INFO | Features::PARAM_PROPS | Features::PARAM_FORMAT | Features::PARAM_PORT_CONFIG
        }
        ObjectKind::Port => Features::INFO | Features::PARAM_FORMAT,
        ObjectKind::Session => Features::INFO | Features::PARAM_PROPS,
        ObjectKind::Endpoint => {
            Features::INFO | Features::PARAM_PROPS | Features::PARAM_ROUTE | Features::CONTROLS
        }
        ObjectKind::Metadata => Features::METADATA_DATA,
    };
    Features::MINIMAL | extra
}

/// The next step needed to reduce `missing`, or `None` when it is empty.
///
/// Pure: looks at the proxy, never changes it.
pub fn next_step(kind: ObjectKind, proxy: &Proxy, missing: Features) -> Result<Option<Step>, ActivationError> {
    let unsupported = missing - supported_features(kind);
    if !unsupported.is_empty() {
        return Err(ActivationError::Unsupported(unsupported));
    }
    if missing.is_empty() {
        return Ok(None);
    }

    let active = proxy.active();
    if missing.intersects(Features::MINIMAL) || !active.contains(Features::PROXY) {
        return Ok(Some(Step::Bind));
    }
    if missing.contains(Features::INFO) {
        return Ok(Some(Step::CacheInfo));
    }

    let mut params = missing & Features::ALL_PARAMS;
    if missing.contains(Features::CONTROLS) && !active.contains(Features::PARAM_PROPS) {
        params |= Features::PARAM_PROPS;
    }
    if let Some(param) = ParamKind::first_in(params) {
        return Ok(Some(Step::CacheParams(param)));
    }
    if missing.contains(Features::CONTROLS) {
        return Ok(Some(Step::CacheControls));
    }
    if missing.contains(Features::METADATA_DATA) {
        return Ok(Some(Step::LoadMetadata));
    }

    // Only reachable with bits no step knows about.
    Err(ActivationError::Unsupported(missing))
}

/// Run `step` on `proxy`.
///
/// Requests are sent at most once: a step whose answer is already pending
/// suspends without sending again.
pub fn execute_step(
    step: Step,
    proxy: &mut Proxy,
    transport: &mut dyn Transport,
) -> Result<StepOutcome, ActivationError> {
    trace!(kind = %proxy.kind(), ?step, "executing activation step");
    match step {
        Step::Bind => match proxy.handle() {
            None => {
                let handle = match proxy.origin() {
                    Origin::Global(id) => transport.bind(*id, proxy.kind()),
                    Origin::Local(properties) => transport.export(proxy.kind(), properties),
                }
                .map_err(|e| ActivationError::Transport(e.to_string()))?;
                proxy.set_handle(Some(handle));
                debug!(kind = %proxy.kind(), %handle, "proxy created");
                let mut gained = Features::PROXY;
                if proxy.bound_id().is_some() {
                    gained |= Features::BOUND;
                }
                Ok(StepOutcome::Complete(gained))
            }
            Some(_) if proxy.bound_id().is_some() => Ok(StepOutcome::Complete(Features::BOUND)),
            Some(_) => Ok(StepOutcome::Suspend),
        },

        Step::CacheInfo => {
            // A local object's info is what it was exported with.
            if proxy.info().is_none()
                && let Origin::Local(properties) = proxy.origin()
            {
                let properties = properties.clone();
                proxy.set_info(properties);
            }
            if proxy.info().is_some() {
                Ok(StepOutcome::Complete(Features::INFO))
            } else {
                Ok(StepOutcome::Suspend)
            }
        }

        Step::CacheParams(param) => {
            if proxy.params(param).is_some() {
                return Ok(StepOutcome::Complete(param.feature()));
            }
            if !proxy.param_pending(param) {
                send(proxy, transport, Request::EnumParams(param))?;
                proxy.set_param_pending(param);
            }
            Ok(StepOutcome::Suspend)
        }

        Step::CacheControls => {
            let Some(props) = proxy.params(ParamKind::Props) else {
                return Err(ActivationError::StepFailed("props parameter not cached".into()));
            };
            let controls = props.to_vec();
            proxy.set_controls(Some(controls));
            Ok(StepOutcome::Complete(Features::CONTROLS))
        }

        Step::LoadMetadata => {
            if proxy.metadata_loaded() {
                return Ok(StepOutcome::Complete(Features::METADATA_DATA));
            }
            if !proxy.sync_pending() {
                send(proxy, transport, Request::Sync)?;
                proxy.set_sync_pending(true);
            }
            Ok(StepOutcome::Suspend)
        }
    }
}

fn send(proxy: &Proxy, transport: &mut dyn Transport, request: Request) -> Result<(), ActivationError> {
    let handle = proxy
        .handle()
        .ok_or_else(|| ActivationError::StepFailed("proxy has no transport handle".into()))?;
    transport
        .call_method(handle, request)
        .map_err(|e| ActivationError::Transport(e.to_string()))
}

/// Release the state behind `features`, highest level first, and clear the
/// bits. Never creates a transition.
///
/// Releasing `PROXY` releases every feature that needs the handle too; only
/// `BOUND` outlives it.
pub fn deactivate(kind: ObjectKind, proxy: &mut Proxy, features: Features) {
    let mut features = features & proxy.active();
    if features.contains(Features::PROXY) {
        features |= proxy.active() - Features::BOUND;
    }
    if features.is_empty() {
        return;
    }
    debug!(%kind, ?features, "deactivating features");

    if features.contains(Features::CONTROLS) {
        proxy.set_controls(None);
    }
    for param in ParamKind::ALL.into_iter().rev() {
        if features.contains(param.feature()) {
            proxy.clear_params(param);
        }
    }
    if features.contains(Features::METADATA_DATA) {
        proxy.clear_metadata();
    }
    if features.contains(Features::INFO) {
        proxy.clear_info();
    }
    // BOUND keeps the id: the object still exists on the server.
    if features.contains(Features::PROXY) {
        proxy.set_handle(None);
    }
    proxy.remove_active(features);
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_middleware::{Call, LoopbackTransport};
    use conduit_types::{ParamBlob, PropertyBag, ProxyEvent, ProxyHandle};

    use crate::activation::ProxyId;

    fn bound_proxy(kind: ObjectKind) -> Proxy {
        Proxy::for_global(ProxyId(1), kind, 10, ProxyHandle(1))
    }

    #[test]
    fn metadata_does_not_support_info() {
        assert!(!supported_features(ObjectKind::Metadata).contains(Features::INFO));
        assert!(supported_features(ObjectKind::Metadata).contains(Features::METADATA_DATA));
        for kind in [ObjectKind::Node, ObjectKind::Client, ObjectKind::Metadata] {
            assert!(supported_features(kind).contains(Features::MINIMAL));
        }
    }

    #[test]
    fn unsupported_features_are_rejected() {
        let proxy = bound_proxy(ObjectKind::Port);
        let err = next_step(ObjectKind::Port, &proxy, Features::PARAM_ROUTE | Features::INFO).unwrap_err();
        assert_eq!(err, ActivationError::Unsupported(Features::PARAM_ROUTE));
    }

    #[test]
    fn steps_follow_declared_order() {
        let mut proxy = bound_proxy(ObjectKind::Device);
        let missing = Features::INFO | Features::PARAM_ROUTE | Features::PARAM_PROFILE;
        assert_eq!(next_step(ObjectKind::Device, &proxy, missing), Ok(Some(Step::CacheInfo)));

        proxy.absorb(&ProxyEvent::Info {
            properties: PropertyBag::new(),
        });
        let missing = Features::PARAM_ROUTE | Features::PARAM_PROFILE;
        assert_eq!(
            next_step(ObjectKind::Device, &proxy, missing),
            Ok(Some(Step::CacheParams(ParamKind::Profile)))
        );
        assert_eq!(next_step(ObjectKind::Device, &proxy, Features::empty()), Ok(None));
    }

    #[test]
    fn controls_pull_props_first() {
        let proxy = bound_proxy(ObjectKind::Endpoint);
        assert_eq!(
            next_step(ObjectKind::Endpoint, &proxy, Features::CONTROLS),
            Ok(Some(Step::CacheParams(ParamKind::Props)))
        );
    }

    #[test]
    fn unbound_local_object_binds_first() {
        let proxy = Proxy::local(ProxyId(2), ObjectKind::Endpoint, PropertyBag::new());
        assert_eq!(
            next_step(ObjectKind::Endpoint, &proxy, Features::STANDARD),
            Ok(Some(Step::Bind))
        );
    }

    #[test]
    fn bind_exports_then_waits_for_bound() {
        let mut transport = LoopbackTransport::new();
        let mut proxy = Proxy::local(ProxyId(2), ObjectKind::Endpoint, PropertyBag::new());

        let outcome = execute_step(Step::Bind, &mut proxy, &mut transport).unwrap();
        assert_eq!(outcome, StepOutcome::Complete(Features::PROXY));
        assert!(matches!(transport.calls()[0], Call::Export { .. }));
        proxy.add_active(Features::PROXY);

        assert_eq!(execute_step(Step::Bind, &mut proxy, &mut transport), Ok(StepOutcome::Suspend));
        proxy.absorb(&ProxyEvent::Bound { global_id: 77 });
        assert_eq!(
            execute_step(Step::Bind, &mut proxy, &mut transport),
            Ok(StepOutcome::Complete(Features::BOUND))
        );
    }

    #[test]
    fn enum_params_is_sent_once() {
        let mut transport = LoopbackTransport::new();
        let mut proxy = bound_proxy(ObjectKind::Node);
        for _ in 0..2 {
            let outcome = execute_step(Step::CacheParams(ParamKind::Format), &mut proxy, &mut transport);
            assert_eq!(outcome, Ok(StepOutcome::Suspend));
        }
        assert_eq!(
            transport.requests_for(ProxyHandle(1)),
            [Request::EnumParams(ParamKind::Format)]
        );
    }

    #[test]
    fn refused_request_fails_the_step() {
        let mut transport = LoopbackTransport::new();
        transport.refuse_methods(true);
        let mut proxy = bound_proxy(ObjectKind::Metadata);
        let err = execute_step(Step::LoadMetadata, &mut proxy, &mut transport).unwrap_err();
        assert!(matches!(err, ActivationError::Transport(_)));
    }

    #[test]
    fn deactivate_clears_caches_and_bits() {
        let mut proxy = bound_proxy(ObjectKind::Endpoint);
        proxy.absorb(&ProxyEvent::Info {
            properties: PropertyBag::new(),
        });
        proxy.absorb(&ProxyEvent::Params {
            param: ParamKind::Props,
            values: vec![ParamBlob(vec![1, 2])],
        });
        proxy.set_controls(Some(vec![ParamBlob(vec![1, 2])]));
        proxy.add_active(Features::INFO | Features::PARAM_PROPS | Features::CONTROLS);

        deactivate(ObjectKind::Endpoint, &mut proxy, Features::CONTROLS | Features::PARAM_PROPS);
        assert_eq!(proxy.active(), Features::MINIMAL | Features::INFO);
        assert!(proxy.params(ParamKind::Props).is_none());
        assert!(proxy.controls().is_none());

        deactivate(ObjectKind::Endpoint, &mut proxy, Features::all());
        assert!(proxy.active().is_empty());
        assert!(proxy.handle().is_none());
        assert!(proxy.info().is_none());
        assert_eq!(proxy.bound_id(), Some(10));
    }

    #[test]
    fn deactivating_proxy_releases_dependent_features() {
        let mut proxy = bound_proxy(ObjectKind::Device);
        proxy.absorb(&ProxyEvent::Info {
            properties: PropertyBag::new(),
        });
        proxy.absorb(&ProxyEvent::Params {
            param: ParamKind::Route,
            values: vec![ParamBlob(vec![3])],
        });
        proxy.add_active(Features::INFO | Features::PARAM_ROUTE);

        deactivate(ObjectKind::Device, &mut proxy, Features::PROXY);
        assert_eq!(proxy.active(), Features::BOUND);
        assert!(proxy.handle().is_none());
        assert!(proxy.info().is_none());
        assert!(proxy.params(ParamKind::Route).is_none());
    }
}
