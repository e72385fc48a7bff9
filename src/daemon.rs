//! Daemon bootstrap and lifecycle.
//!
//! Startup order: single-instance lock, picker ingress, network entry
//! monitor, identity, orchestrator; shutdown happens in reverse through the
//! shared cancellation signal, with the discovery quit beacon sent before
//! the process exits. The only fatal startup errors are a lost
//! single-instance lock and a picker server that cannot start.
//!
//! This binary runs headless: a minimal frontend task logs every event and
//! answers routed decisions with the documented defaults. A graphical
//! frontend replaces it by wiring its own decision channels.

use crate::args::Args;
use crate::core::engine::{Engine, UiChannels};
use crate::core::events::{CoreEvent, SessionEvent};
use crate::core::identity::{LocalIdentity, OperationalMode};
use crate::core::network_entries::EntriesMonitor;
use crate::core::picker;
use crate::core::reception::{ReceptionAction, ReceptionPolicy};
use crate::utils::fmt::format_size;
use crate::utils::lock::InstanceLock;
use crate::utils::paths;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let conf_path = paths::conf().to_path_buf();
    let data_path = paths::data().to_path_buf();
    info!(event = "daemon_starting", conf = %conf_path.display(), data = %data_path.display(), "Share Your Files starting");

    std::fs::create_dir_all(&conf_path)
        .with_context(|| format!("failed creating {}", conf_path.display()))?;
    let _lock = InstanceLock::acquire(&conf_path.join("shareyourfiles.lock"))?;

    // Local identity, with command-line overrides applied.
    let mut identity = LocalIdentity::load_or_create(&conf_path, &data_path);
    if args.first_name.is_some() || args.last_name.is_some() {
        let first = args
            .first_name
            .as_deref()
            .unwrap_or_else(|| identity.first_name())
            .to_string();
        let last = args
            .last_name
            .as_deref()
            .unwrap_or_else(|| identity.last_name())
            .to_string();
        if let Err(e) = identity.set_names(&first, &last) {
            warn!(event = "names_rejected", error = %e, "Keeping the previous names");
        }
    }
    if args.auto_accept {
        let mut policy = ReceptionPolicy::defaults(&data_path);
        policy.action = ReceptionAction::Accept;
        identity.set_policy(policy, &data_path);
    }
    let identity = Arc::new(Mutex::new(identity));

    // Picker ingress: failure to start is fatal.
    let (paths_tx, paths_rx) = mpsc::channel(8);
    picker::start(paths_tx, sos.clone())?;

    let monitor = EntriesMonitor::spawn(sos.clone());

    // Frontend channels: this headless build logs and answers defaults.
    let (sharing_tx, sharing_rx) = mpsc::channel(8);
    let (duplicate_tx, duplicate_rx) = mpsc::channel(8);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();

    spawn_headless_frontend(sharing_rx, duplicate_rx, events_rx, session_events_rx);

    let (engine, engine_task) = Engine::spawn(
        identity,
        conf_path,
        data_path,
        monitor,
        UiChannels {
            sharing_sink: sharing_tx,
            duplicate_sink: duplicate_tx,
            events: events_tx,
            session_events: session_events_tx,
        },
        paths_rx,
        sos.clone(),
    );

    if !args.offline {
        if let Err(e) = engine.set_mode(OperationalMode::Online, false).await {
            warn!(event = "online_failure", error = %e, "Could not go online, staying offline");
        }
    }

    info!(event = "daemon_started", "Share Your Files started");
    sos.wait().await;

    // The orchestrator drains sessions, flushes the registry and lets the
    // discovery task emit its quit beacon.
    let _ = engine_task.await;
    info!(event = "daemon_stopped", "Share Your Files stopped");
    Ok(())
}

/// Headless stand-in for the UI layer: logs everything, lets routed
/// decisions fall back to their defaults (reject the request, keep the
/// existing file) by dropping the reply senders.
fn spawn_headless_frontend(
    mut sharing_rx: mpsc::Receiver<(
        crate::core::events::SharingRequest,
        tokio::sync::oneshot::Sender<crate::core::events::SharingDecision>,
    )>,
    mut duplicate_rx: mpsc::Receiver<(
        crate::core::events::DuplicateFile,
        tokio::sync::oneshot::Sender<crate::core::events::DuplicateFileDecision>,
    )>,
    mut events_rx: mpsc::UnboundedReceiver<CoreEvent>,
    mut session_events_rx: mpsc::UnboundedReceiver<(u32, SessionEvent)>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = sharing_rx.recv() => match request {
                    Some((request, _reply)) => {
                        warn!(
                            event = "share_needs_decision",
                            peer = %request.peer_name,
                            files = request.total_files,
                            size = %format_size(request.total_bytes),
                            "No frontend attached, rejecting the sharing request"
                        );
                    }
                    None => return,
                },
                conflict = duplicate_rx.recv() => match conflict {
                    Some((conflict, _reply)) => {
                        warn!(
                            event = "duplicate_needs_decision",
                            file = %conflict.relative_path,
                            "No frontend attached, keeping the existing file"
                        );
                    }
                    None => return,
                },
                core_event = events_rx.recv() => match core_event {
                    Some(event) => info!(event = "core_event", detail = ?event, "Core event"),
                    None => return,
                },
                session_event = session_events_rx.recv() => match session_event {
                    Some((id, event)) => {
                        info!(event = "session_event", session = id, detail = ?event, "Session event")
                    }
                    None => return,
                },
            }
        }
    });
}

