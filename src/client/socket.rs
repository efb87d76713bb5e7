//! Reconnecting client connection state machine.
//!
//! One `ChatSocket` maintains a single logical connection across transport
//! failures: `Idle -> Connecting -> Open -> Closed`, where an abnormal close
//! schedules a reconnect with exponential backoff and a normal close or
//! explicit `disconnect()` terminates the session. Every `connect()` and
//! `disconnect()` bumps a generation counter carried on a watch channel; a
//! session task whose generation is superseded exits at its next suspension
//! point, which is what cancels stale reconnect timers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::ClientConfig;

use super::listeners::{ListenerRegistry, ListenerToken};
use super::queue::OutboundQueue;
use super::transport::{Transport, TransportEvent, TransportFactory, CLOSE_NORMAL};

/// Connectivity state surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected
    Idle,
    /// First connection attempt in flight
    Connecting,
    /// Transport open and identified
    Open,
    /// Abnormal close observed, reconnect scheduled
    Reconnecting,
    /// Intentionally disconnected or closed normally; no reconnect
    Disconnected,
    /// Reconnect budget exhausted; requires an explicit connect()
    Error,
}

/// Result of a send attempt, never a hard error.
///
/// `Queued` means "queued, not lost, unless the queue later overflows". The
/// one exception is a payload that fails to serialize: it is logged and
/// dropped, and still reported as `Queued` (unreachable for any
/// `serde_json::Value`, which always serializes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

/// Backoff delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    Duration::from_millis(exp.min(max_ms))
}

struct ClientState {
    url: Option<String>,
    generation: u64,
    intentional: bool,
    attempts: u32,
    queue: OutboundQueue,
    /// Writer channel of the currently open session, if any
    session_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    status: ConnectionStatus,
}

struct Shared {
    user_id: String,
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<ClientState>,
    listeners: ListenerRegistry,
    gen_tx: watch::Sender<u64>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("client state lock poisoned")
    }

    fn set_status(&self, state: &mut ClientState, status: ConnectionStatus) {
        state.status = status;
        let _ = self.status_tx.send_replace(status);
    }
}

/// A single reusable connection object per client process.
#[derive(Clone)]
pub struct ChatSocket {
    shared: Arc<Shared>,
}

impl ChatSocket {
    pub fn new(user_id: impl Into<String>, config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (gen_tx, _) = watch::channel(0u64);
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        let queue_capacity = config.queue_capacity;

        Self {
            shared: Arc::new(Shared {
                user_id: user_id.into(),
                config,
                factory,
                state: Mutex::new(ClientState {
                    url: None,
                    generation: 0,
                    intentional: false,
                    attempts: 0,
                    queue: OutboundQueue::new(queue_capacity),
                    session_tx: None,
                    status: ConnectionStatus::Idle,
                }),
                listeners: ListenerRegistry::new(),
                gen_tx,
                status_tx,
            }),
        }
    }

    /// Open (or re-point) the logical connection.
    ///
    /// Coalescing: already open or connecting to the same url is a no-op.
    /// A different url supersedes the active session, which closes without
    /// triggering its reconnect policy.
    pub fn connect(&self, url: &str) {
        let generation = {
            let mut state = self.shared.lock();

            let same_url = state.url.as_deref() == Some(url);
            let active = matches!(
                state.status,
                ConnectionStatus::Open | ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            );
            if same_url && active {
                tracing::debug!(url = %url, "connect() coalesced, session already active");
                return;
            }

            state.generation += 1;
            state.url = Some(url.to_string());
            state.intentional = false;
            state.attempts = 0;
            state.session_tx = None;
            self.shared.set_status(&mut state, ConnectionStatus::Connecting);
            state.generation
        };

        let _ = self.shared.gen_tx.send_replace(generation);

        let shared = self.shared.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            run_session(shared, url, generation).await;
        });
    }

    /// Hard reset: close normally, cancel any pending reconnect, clear the
    /// queue and all listeners. No reconnect fires for the torn-down socket.
    pub fn disconnect(&self) {
        let generation = {
            let mut state = self.shared.lock();
            state.intentional = true;
            state.generation += 1;
            state.session_tx = None;
            state.queue.clear();
            state.attempts = 0;
            state.url = None;
            self.shared.set_status(&mut state, ConnectionStatus::Disconnected);
            state.generation
        };
        let _ = self.shared.gen_tx.send_replace(generation);
        self.shared.listeners.clear();
    }

    /// Transmit now if open, otherwise queue. Always returns synchronously.
    pub fn send(&self, payload: &Value) -> SendOutcome {
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound payload");
                return SendOutcome::Queued;
            }
        };

        let mut state = self.shared.lock();
        if state.status == ConnectionStatus::Open {
            if let Some(tx) = &state.session_tx {
                if tx.send(text.clone()).is_ok() {
                    return SendOutcome::Sent;
                }
            }
        }

        state.queue.push(text);
        SendOutcome::Queued
    }

    /// Register a listener for every parsed inbound frame.
    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, token: ListenerToken) {
        self.shared.listeners.remove(token);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.subscribe().borrow()
    }

    /// Watch channel for connectivity state changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

/// Session task: owns one generation of the logical connection, including its
/// reconnect loop. Exits as soon as its generation is superseded.
async fn run_session(shared: Arc<Shared>, url: String, my_gen: u64) {
    let mut gen_rx = shared.gen_tx.subscribe();

    loop {
        if *gen_rx.borrow() != my_gen {
            return;
        }

        match shared.factory.connect(&url).await {
            Ok(transport) => {
                match run_open_transport(&shared, transport, my_gen, &mut gen_rx).await {
                    SessionEnd::Superseded => return,
                    SessionEnd::Terminal => return,
                    SessionEnd::Abnormal => {}
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Connection attempt failed");
            }
        }

        // Abnormal close or failed attempt: back off, then retry
        let attempt = {
            let mut state = shared.lock();
            if state.generation != my_gen {
                return;
            }
            if state.attempts >= shared.config.max_reconnect_attempts {
                tracing::warn!(
                    attempts = state.attempts,
                    "Reconnect budget exhausted, giving up"
                );
                shared.set_status(&mut state, ConnectionStatus::Error);
                return;
            }
            let attempt = state.attempts;
            state.attempts += 1;
            shared.set_status(&mut state, ConnectionStatus::Reconnecting);
            attempt
        };

        let delay = reconnect_delay(attempt, shared.config.base_delay_ms, shared.config.max_delay_ms);
        tracing::info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = gen_rx.changed() => {
                if *gen_rx.borrow() != my_gen {
                    // A newer connect() or disconnect() superseded this timer
                    return;
                }
            }
        }
    }
}

enum SessionEnd {
    /// Generation superseded; nothing more to do
    Superseded,
    /// Normal close or intentional disconnect; no reconnect
    Terminal,
    /// Abnormal close; caller schedules a reconnect
    Abnormal,
}

async fn run_open_transport(
    shared: &Arc<Shared>,
    mut transport: Box<dyn Transport>,
    my_gen: u64,
    gen_rx: &mut watch::Receiver<u64>,
) -> SessionEnd {
    let (session_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    // Mark open and steal the queue for flushing
    let pending = {
        let mut state = shared.lock();
        if state.generation != my_gen {
            None
        } else {
            state.attempts = 0;
            state.session_tx = Some(session_tx);
            shared.set_status(&mut state, ConnectionStatus::Open);
            Some(state.queue.drain())
        }
    };
    let Some(pending) = pending else {
        let _ = transport.close().await;
        return SessionEnd::Superseded;
    };

    tracing::info!(queued = pending.len(), "Connection open, identifying");

    // Identify, request the presence snapshot, then flush the queue in FIFO
    // order. Any send failure here is an abnormal close.
    let handshake = [
        json!({"type": "identify", "userId": shared.user_id}).to_string(),
        json!({"type": "online_connections"}).to_string(),
    ];
    for frame in handshake {
        if transport.send_text(frame).await.is_err() {
            requeue_unsent(shared, my_gen, pending);
            return close_session(shared, my_gen, None);
        }
    }

    let mut pending = pending.into_iter();
    while let Some(frame) = pending.next() {
        if transport.send_text(frame.clone()).await.is_err() {
            let mut unsent = vec![frame];
            unsent.extend(pending);
            requeue_unsent(shared, my_gen, unsent);
            return close_session(shared, my_gen, None);
        }
    }

    // Steady state: pump outbound frames and fan inbound frames to listeners
    let close_code = loop {
        tokio::select! {
            changed = gen_rx.changed() => {
                let superseded = changed.is_err() || *gen_rx.borrow() != my_gen;
                if superseded {
                    let _ = transport.close().await;
                    return SessionEnd::Superseded;
                }
            }
            out = out_rx.recv() => {
                match out {
                    Some(text) => {
                        if transport.send_text(text).await.is_err() {
                            break None;
                        }
                    }
                    None => break None,
                }
            }
            event = transport.next_event() => {
                match event {
                    Some(TransportEvent::Text(text)) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => shared.listeners.emit(&value),
                            Err(e) => {
                                tracing::warn!(error = %e, "Malformed inbound frame, dropping");
                            }
                        }
                    }
                    Some(TransportEvent::Closed { code }) => break Some(code),
                    None => break None,
                }
            }
        }
    };

    close_session(shared, my_gen, close_code)
}

fn requeue_unsent(shared: &Arc<Shared>, my_gen: u64, unsent: Vec<String>) {
    let mut state = shared.lock();
    if state.generation == my_gen && !unsent.is_empty() {
        state.queue.requeue_front(unsent);
    }
}

fn close_session(shared: &Arc<Shared>, my_gen: u64, close_code: Option<u16>) -> SessionEnd {
    let mut state = shared.lock();
    if state.generation != my_gen {
        return SessionEnd::Superseded;
    }

    state.session_tx = None;

    let normal = close_code == Some(CLOSE_NORMAL);
    if state.intentional || normal {
        tracing::info!(code = ?close_code, "Connection closed, not reconnecting");
        shared.set_status(&mut state, ConnectionStatus::Disconnected);
        SessionEnd::Terminal
    } else {
        tracing::warn!(code = ?close_code, "Connection closed abnormally");
        SessionEnd::Abnormal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_policy() {
        let delays: Vec<u64> = (0..6)
            .map(|attempt| reconnect_delay(attempt, 1_000, 10_000).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn backoff_survives_large_attempts() {
        assert_eq!(
            reconnect_delay(63, 1_000, 10_000),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            reconnect_delay(200, 1_000, 10_000),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn send_while_idle_queues() {
        let socket = ChatSocket::new(
            "u1",
            ClientConfig::default(),
            Arc::new(super::super::transport::WsTransportFactory),
        );
        let outcome = socket.send(&json!({"type": "chat_message"}));
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(socket.queued_len(), 1);
        assert_eq!(socket.status(), ConnectionStatus::Idle);
    }

    #[test]
    fn queue_bound_honored_while_closed() {
        let socket = ChatSocket::new(
            "u1",
            ClientConfig::default(),
            Arc::new(super::super::transport::WsTransportFactory),
        );
        for i in 0..150 {
            socket.send(&json!({"seq": i}));
        }
        assert_eq!(socket.queued_len(), 100);
    }
}
