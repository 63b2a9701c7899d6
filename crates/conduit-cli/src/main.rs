//! `conduitd` – Conduit replay daemon
//!
//! Drives the registry from a recorded event stream:
//!
//! 1. Loads `~/.conduit/config.toml`, writing the defaults there on first
//!    run. `CONDUIT_*` variables override the file.
//! 2. Restores the persisted settings and registers the settings loader plus
//!    one logging watcher per `[[watch]]` entry.
//! 3. Reads JSON-lines transport events from the file given as the first
//!    argument, or from stdin, and feeds them through the event loop against
//!    an auto-replying loopback transport.
//! 4. Stops at end of input or on **Ctrl-C**, then saves the settings.
//!
//! ```text
//! conduitd session.jsonl
//! RUST_LOG=debug CONDUIT_LOG_FORMAT=json conduitd < session.jsonl
//! ```

mod config;
mod replay;

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conduit_kernel::Settings;
use conduit_memory::StateStore;
use conduit_middleware::{LoopbackTransport, channel};
use conduit_runtime::{EventLoop, Registry, SettingsLoader, init_tracing};
use conduit_types::ConduitError;
use tracing::{error, info, warn};

use crate::replay::LogWatcher;

fn main() -> ExitCode {
    let _guard = init_tracing("conduitd");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "conduitd failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), ConduitError> {
    // ── First run ─────────────────────────────────────────────────────────
    match config::init_default() {
        Ok(true) => info!(path = %config::config_path().display(), "wrote default configuration"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "could not write default configuration, continuing with defaults"),
    }

    let cfg = config::load()?;
    info!(
        path = %config::config_path().display(),
        settings = %cfg.settings_metadata,
        watches = cfg.watches.len(),
        "configuration loaded"
    );

    // ── Settings ──────────────────────────────────────────────────────────
    let store = match &cfg.state_dir {
        Some(dir) => StateStore::with_dir(dir.clone(), cfg.settings_metadata.clone()),
        None => StateStore::new(cfg.settings_metadata.clone())?,
    };
    let settings = Rc::new(RefCell::new(Settings::new(cfg.settings_metadata.clone())));
    let persisted = store.load()?;
    if !persisted.is_empty() {
        settings.borrow_mut().load(persisted.iter());
    }

    // ── Registry & watchers ───────────────────────────────────────────────
    let mut registry = Registry::new(LoopbackTransport::with_auto_reply());
    SettingsLoader::register(&mut registry, Rc::clone(&settings))?;
    for watch in &cfg.watches {
        let id = registry.register_watcher(watch.interests.clone(), watch.target, LogWatcher::new(&watch.name))?;
        info!(watch = %watch.name, watcher = %id, target = ?watch.target, "watch registered");
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; only end of input stops the daemon");
    }

    // ── Event loop ────────────────────────────────────────────────────────
    let (tx, queue) = channel(cfg.queue_capacity);
    let mut event_loop = EventLoop::new(registry, queue);
    let source = std::env::args().nth(1);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ConduitError::Transport(format!("failed to start runtime: {e}")))?;

    let fed = runtime.block_on(async {
        let feeder = tokio::spawn(replay::feed_source(source, tx));
        event_loop.run(shutdown).await;
        feeder.abort();
        match feeder.await {
            Ok(result) => result.map(Some),
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => Err(ConduitError::Transport(format!("event reader failed: {e}"))),
        }
    });
    // A cancelled stdin read may still be parked on a blocking thread.
    runtime.shutdown_background();

    let (handled, skipped) = event_loop.stats();
    let registry = event_loop.into_registry();
    info!(
        fed = ?fed.as_ref().ok().copied().flatten(),
        handled,
        skipped,
        globals = registry.global_count(),
        "replay finished"
    );
    fed?;

    // ── Persist ───────────────────────────────────────────────────────────
    if cfg.persist_settings {
        store.save(&settings.borrow().to_property_bag())?;
        info!(path = %store.location().display(), "settings saved");
    }
    Ok(())
}
