use crate::pipeline::cache::LatestStateCache;
use crate::types::{Event, RateSnapshot};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Frames a session may have queued before it counts as a failed write.
pub const SESSION_BUFFER: usize = 64;

struct Session {
    tx: mpsc::Sender<Arc<str>>,
    heartbeat: JoinHandle<()>,
}

type SessionTable = Arc<Mutex<HashMap<String, Session>>>;

fn lock(sessions: &SessionTable) -> MutexGuard<'_, HashMap<String, Session>> {
    sessions.lock().unwrap_or_else(|p| p.into_inner())
}

/// Removes a session and cancels its heartbeat. Returns false if it was already gone.
fn teardown(sessions: &SessionTable, id: &str) -> bool {
    let removed = lock(sessions).remove(id);
    match removed {
        Some(session) => {
            session.heartbeat.abort();
            debug!("Subscriber {} removed", id);
            true
        }
        None => false,
    }
}

fn encode(event: &Event) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to encode {} event: {}", event.kind(), e);
            None
        }
    }
}

/// Receiving end of one subscriber session, handed to the transport.
///
/// Dropping it unsubscribes the session.
pub struct Subscription {
    id: String,
    events: mpsc::Receiver<Arc<str>>,
    sessions: SessionTable,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next encoded event, or `None` once the session has been torn down.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if teardown(&self.sessions, &self.id) {
            info!("Subscriber disconnected: {}", self.id);
        }
    }
}

/// Live set of subscriber sessions and the fan-out over it.
pub struct Broadcaster {
    sessions: SessionTable,
    cache: Arc<LatestStateCache>,
    heartbeat: Duration,
}

impl Broadcaster {
    pub fn new(cache: Arc<LatestStateCache>, heartbeat: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            cache,
            heartbeat,
        }
    }

    pub fn cache(&self) -> &Arc<LatestStateCache> {
        &self.cache
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Registers a session, queues `connected` plus the cached snapshot, and starts its heartbeat.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);

        let mut sessions = lock(&self.sessions);
        // Holding the table lock keeps the replay and the next publish_latest from overlapping.
        let mut greeting = vec![Event::connected(&id)];
        if let Some(cached) = self.cache.current() {
            greeting.push(Event::rates_update(cached.snapshot));
        }
        for frame in greeting.iter().filter_map(encode) {
            // Fresh channel, cannot be full.
            let _ = tx.try_send(frame);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.sessions.clone(),
            id.clone(),
            tx.clone(),
            self.heartbeat,
        ));
        sessions.insert(id.clone(), Session { tx, heartbeat });
        let live = sessions.len();
        drop(sessions);

        info!("New subscriber connected: {} ({} live)", id, live);
        Subscription {
            id,
            events: rx,
            sessions: self.sessions.clone(),
        }
    }

    /// Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) -> bool {
        teardown(&self.sessions, id)
    }

    /// Sends `event` to every live session and returns how many accepted it.
    pub fn publish(&self, event: &Event) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let mut sessions = lock(&self.sessions);
        fan_out(&mut sessions, frame, event.kind())
    }

    /// Replaces the cached snapshot and pushes it as `ratesUpdate` in one step.
    pub fn publish_latest(&self, snapshot: RateSnapshot) -> usize {
        let mut sessions = lock(&self.sessions);
        let cached = self.cache.update(snapshot);
        let event = Event::rates_update(cached.snapshot);
        match encode(&event) {
            Some(frame) => fan_out(&mut sessions, frame, event.kind()),
            None => 0,
        }
    }
}

fn fan_out(sessions: &mut HashMap<String, Session>, frame: Arc<str>, kind: &str) -> usize {
    let mut failed = Vec::new();
    for (id, session) in sessions.iter() {
        if let Err(e) = session.tx.try_send(frame.clone()) {
            warn!("Dropping subscriber {} after failed {} write: {}", id, kind, e);
            failed.push(id.clone());
        }
    }
    for id in &failed {
        if let Some(session) = sessions.remove(id) {
            session.heartbeat.abort();
        }
    }
    let delivered = sessions.len();
    debug!("Broadcast {} to {} subscribers", kind, delivered);
    delivered
}

async fn heartbeat_loop(
    sessions: SessionTable,
    id: String,
    tx: mpsc::Sender<Arc<str>>,
    period: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(frame) = encode(&Event::heartbeat()) else {
            continue;
        };
        if tx.try_send(frame).is_err() {
            warn!("Heartbeat to {} failed, removing session", id);
            teardown(&sessions, &id);
            break;
        }
    }
}
