use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::Responder;

/// Largest datagram the socket forwarders will accept: a jumbo-frame UDP
/// payload plus application packet header, with headroom.
const MAX_DATAGRAM: usize = 16 * 1024;

/// Poll timeout cap when no timer is due sooner.
const TICKLESS_CAP: Duration = Duration::from_secs(3600);

/// An event delivered to a registered source callback.
pub enum ReactorEvent {
    /// Payload received on a pair or subscribe channel.
    Message(Vec<u8>),
    /// Request received on a reply channel; the responder routes the reply
    /// back to the originating connection.
    Request { data: Vec<u8>, responder: Responder },
    /// Datagram received on a registered UDP socket.
    Datagram {
        data: Vec<u8>,
        from: SocketAddr,
        port: u16,
    },
}

/// Event stream handed to `register_channel` by the channel types.
pub type ChannelEvents = mpsc::UnboundedReceiver<ReactorEvent>;

pub type SourceCallback = Box<dyn FnMut(ReactorEvent) + Send>;
pub type TimerCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    delay: Duration,
    /// Fires left; 0 means indefinite.
    remaining: u64,
    next_due: Instant,
    /// Taken out while the callback runs, so a callback may register new
    /// timers without deadlocking on the shared state.
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct TimerState {
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

/// Shared handle onto the reactor's timer set. Cloneable so that timer
/// callbacks can register further timers during dispatch; removals take
/// effect on the next loop iteration.
#[derive(Clone, Default)]
pub struct Timers {
    state: Arc<Mutex<TimerState>>,
}

impl Timers {
    /// Register a periodic timer. `fires == 0` means fire indefinitely.
    /// The first fire is due `delay_ms` from now; after each fire the due
    /// time advances by exactly `delay_ms`.
    pub fn register(&self, delay_ms: u64, fires: u64, callback: TimerCallback) -> TimerId {
        let delay = Duration::from_millis(delay_ms);
        let mut state = lock_state(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            TimerEntry {
                delay,
                remaining: fires,
                next_due: Instant::now() + delay,
                callback: Some(callback),
            },
        );
        TimerId(id)
    }

    pub fn remove(&self, id: TimerId) {
        lock_state(&self.state).entries.remove(&id.0);
    }

    pub fn len(&self) -> usize {
        lock_state(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_deadline(&self) -> Instant {
        let cap = Instant::now() + TICKLESS_CAP;
        lock_state(&self.state)
            .entries
            .values()
            .map(|e| e.next_due)
            .min()
            .map_or(cap, |due| due.min(cap))
    }

    fn due_ids(&self, now: Instant) -> Vec<u64> {
        lock_state(&self.state)
            .entries
            .iter()
            .filter(|(_, e)| e.next_due <= now && e.callback.is_some())
            .map(|(id, _)| *id)
            .collect()
    }
}

fn lock_state(state: &Mutex<TimerState>) -> std::sync::MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("timer state lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Cloneable stop signal for a running reactor, observed at the top of
/// each loop iteration.
#[derive(Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Tickless event loop multiplexing message channels, UDP sockets and
/// periodic timers.
///
/// Each registered source feeds one merged event queue through a forwarder
/// task; the loop dispatches ready source callbacks first, then fires due
/// timers, then recomputes the poll deadline from the earliest pending
/// timer (capped at one hour). Callbacks run on the loop and must not call
/// `run` themselves; a panicking callback is contained and logged.
pub struct Reactor {
    event_tx: mpsc::UnboundedSender<(usize, ReactorEvent)>,
    event_rx: mpsc::UnboundedReceiver<(usize, ReactorEvent)>,
    callbacks: Vec<SourceCallback>,
    forwarders: Vec<JoinHandle<()>>,
    timers: Timers,
    stop: StopHandle,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            event_tx,
            event_rx,
            callbacks: Vec::new(),
            forwarders: Vec::new(),
            timers: Timers::default(),
            stop: StopHandle::default(),
        }
    }

    /// Register a channel event stream and its callback.
    pub fn register_channel(&mut self, mut events: ChannelEvents, callback: SourceCallback) {
        let id = self.callbacks.len();
        self.callbacks.push(callback);
        let tx = self.event_tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((id, event)).is_err() {
                    break;
                }
            }
        }));
    }

    /// Register a UDP socket; the callback receives each datagram.
    pub fn register_socket(&mut self, socket: Arc<UdpSocket>, callback: SourceCallback) {
        let id = self.callbacks.len();
        self.callbacks.push(callback);
        let tx = self.event_tx.clone();
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        self.forwarders.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let event = ReactorEvent::Datagram {
                            data: buf[..len].to_vec(),
                            from,
                            port,
                        };
                        if tx.send((id, event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(port, error = %e, "udp receive failed, stopping socket forwarder");
                        break;
                    }
                }
            }
        }));
    }

    pub fn register_timer(&self, delay_ms: u64, fires: u64, callback: TimerCallback) -> TimerId {
        self.timers.register(delay_ms, fires, callback)
    }

    pub fn remove_timer(&self, id: TimerId) {
        self.timers.remove(id);
    }

    /// Shared timer handle, e.g. for registration from within callbacks.
    pub fn timers(&self) -> Timers {
        self.timers.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the loop until the stop handle fires. Within one iteration all
    /// ready source callbacks run before due timers.
    pub async fn run(&mut self) {
        loop {
            if self.stop.is_stopped() {
                break;
            }

            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;
                event = self.event_rx.recv() => match event {
                    Some((id, event)) => {
                        self.dispatch(id, event);
                        // Drain everything already queued, so every ready
                        // source fires before the timer scan below.
                        while let Ok((id, event)) = self.event_rx.try_recv() {
                            self.dispatch(id, event);
                        }
                    }
                    // All senders gone: no sources will ever fire again.
                    None if self.timers.is_empty() => break,
                    None => tokio::time::sleep_until(deadline).await,
                },
                _ = self.stop.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }

            self.fire_due_timers();
        }
    }

    fn dispatch(&mut self, id: usize, event: ReactorEvent) {
        if let Some(callback) = self.callbacks.get_mut(id) {
            let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                tracing::error!(source = id, "reactor source callback panicked");
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        for id in self.timers.due_ids(now) {
            let taken = lock_state(&self.timers.state)
                .entries
                .get_mut(&id)
                .and_then(|e| e.callback.take());
            let Some(mut callback) = taken else { continue };

            let result = catch_unwind(AssertUnwindSafe(|| callback()));
            if result.is_err() {
                tracing::error!(timer = id, "reactor timer callback panicked");
            }

            let mut state = lock_state(&self.timers.state);
            // The callback may have removed its own entry; nothing to
            // restore in that case.
            if let Some(entry) = state.entries.get_mut(&id) {
                if entry.remaining == 1 {
                    state.entries.remove(&id);
                } else {
                    if entry.remaining > 1 {
                        entry.remaining -= 1;
                    }
                    entry.next_due += entry.delay;
                    entry.callback = Some(callback);
                }
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}
