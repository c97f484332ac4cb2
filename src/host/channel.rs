//! Host command channel and router over the update state machine.
//!
//! Each request is routed on its own task so that a long-running
//! `install_update` never blocks `cancel_update` or `update_status`.
//! State transitions and download events are forwarded to every
//! subscriber as [`EventEnvelope`]s.

use crate::error::{Result, UpdaterError};
use crate::host::contract::{
    CommandEnvelope, CommandName, EVENT_VERSION, EventEnvelope, ResponseEnvelope,
    UPDATE_STATE_EVENT,
};
use crate::update::events::{AttemptEvent, INSTALL_EVENT_CHANNEL};
use crate::update::state::{UpdateState, UpdateStateMachine};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

/// Delivers every event to every subscriber, in publish order.
#[derive(Clone, Default)]
struct EventFanout {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EventEnvelope>>>>,
}

impl EventFanout {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    fn publish(&self, event: EventEnvelope) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<EventEnvelope>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    events: EventFanout,
}

impl HostCommandClient {
    /// Dispatch one command and wait for its response.
    ///
    /// Command failures come back as `ok: false` envelopes; only an invalid
    /// envelope or a closed channel is an `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Channel`] if the envelope is invalid or the
    /// server has gone away.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            UpdaterError::Channel(format!(
                "invalid host command envelope {}: {e}",
                envelope.request_id
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| UpdaterError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| UpdaterError::Channel(format!("host command response dropped: {e}")))
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        self.events.subscribe()
    }
}

pub struct HostCommandServer {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    events: EventFanout,
    machine: Arc<UpdateStateMachine>,
}

#[must_use]
pub fn command_channel(
    request_capacity: usize,
    machine: Arc<UpdateStateMachine>,
) -> (HostCommandClient, HostCommandServer) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));
    let events = EventFanout::default();

    (
        HostCommandClient {
            request_tx,
            events: events.clone(),
        },
        HostCommandServer {
            request_rx,
            events,
            machine,
        },
    )
}

impl HostCommandServer {
    /// Serve requests until every client has been dropped.
    pub async fn run(mut self) {
        let forwarders = [
            tokio::spawn(forward_states(
                self.machine.subscribe(),
                self.events.clone(),
            )),
            tokio::spawn(forward_downloads(
                self.machine.subscribe_downloads(),
                self.events.clone(),
            )),
        ];

        while let Some(request) = self.request_rx.recv().await {
            let machine = Arc::clone(&self.machine);
            tokio::spawn(async move {
                let HostCommandRequest {
                    envelope,
                    response_tx,
                } = request;
                let response = route(&machine, &envelope).await.unwrap_or_else(|e| {
                    warn!(command = envelope.command.as_str(), error = %e, "host command failed");
                    ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
                });
                let _ = response_tx.send(response);
            });
        }

        for forwarder in forwarders {
            forwarder.abort();
        }
    }
}

/// Route a command envelope to the state machine.
///
/// # Errors
///
/// Returns the state machine's error for a failed or rejected operation.
pub async fn route(
    machine: &UpdateStateMachine,
    envelope: &CommandEnvelope,
) -> Result<ResponseEnvelope> {
    debug!(
        command = envelope.command.as_str(),
        request_id = %envelope.request_id,
        "routing host command"
    );
    let payload = match envelope.command {
        CommandName::Ping => serde_json::json!({
            "pong": true,
            "contract_version": EVENT_VERSION,
        }),
        CommandName::FetchUpdate => {
            let update = machine.check_for_update().await?;
            to_json(&update)?
        }
        CommandName::InstallUpdate => machine.install().await.map(unreachable_value)?,
        CommandName::GracefulRestart => machine.graceful_restart().await.map(unreachable_value)?,
        CommandName::UpdateStatus => status_payload(machine)?,
        CommandName::CancelUpdate => {
            machine.cancel()?;
            serde_json::json!({"accepted": true})
        }
        CommandName::RetryUpdate => {
            machine.retry_from_failed()?;
            status_payload(machine)?
        }
    };
    Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
}

/// Neither `install` nor `graceful_restart` returns on success.
fn unreachable_value(never: Infallible) -> serde_json::Value {
    match never {}
}

fn status_payload(machine: &UpdateStateMachine) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "current_version": machine.current_version(),
        "attempt": machine.attempt(),
        "state": to_json(&machine.state())?,
    }))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| UpdaterError::Channel(format!("failed to serialize payload: {e}")))
}

async fn forward_states(mut states: watch::Receiver<UpdateState>, events: EventFanout) {
    while states.changed().await.is_ok() {
        let snapshot = states.borrow_and_update().clone();
        match serde_json::to_value(&snapshot) {
            Ok(payload) => events.publish(EventEnvelope::fresh(UPDATE_STATE_EVENT, payload)),
            Err(e) => warn!(error = %e, "failed to serialize state snapshot; skipping"),
        }
    }
}

async fn forward_downloads(
    mut downloads: mpsc::UnboundedReceiver<AttemptEvent>,
    events: EventFanout,
) {
    while let Some(stamped) = downloads.recv().await {
        match serde_json::to_value(stamped.event) {
            Ok(payload) => events.publish(EventEnvelope::fresh(INSTALL_EVENT_CHANNEL, payload)),
            Err(e) => warn!(error = %e, "failed to serialize download event; skipping"),
        }
    }
}
