//! In-process request statistics and the event feed behind `/logs`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Recent events kept for replay to late subscribers.
const RECENT_CAP: usize = 200;

/// Capacity of each subscriber's feed; slow consumers lose events rather
/// than stalling the proxy.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub ts: DateTime<Utc>,
    pub host: String,
    pub method: String,
    pub path: String,
    pub code: u16,
    pub ms: i64,
    #[serde(rename = "bytesIn")]
    pub bytes_in: u64,
    #[serde(rename = "bytesOut")]
    pub bytes_out: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct HostStat {
    req: u64,
    #[serde(rename = "bytesIn")]
    bytes_in: u64,
    #[serde(rename = "bytesOut")]
    bytes_out: u64,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    #[serde(rename = "uptimeSec")]
    uptime_sec: u64,
    #[serde(rename = "totalRequests")]
    total_requests: u64,
    codes: HashMap<u16, u64>,
    #[serde(rename = "bytesIn")]
    bytes_in: u64,
    #[serde(rename = "bytesOut")]
    bytes_out: u64,
    hosts: HashMap<String, HostStat>,
}

#[derive(Default)]
struct MapState {
    codes: HashMap<u16, u64>,
    hosts: HashMap<String, HostStat>,
    recent: VecDeque<RequestEvent>,
}

pub struct Aggregator {
    started_at: Instant,
    total_requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    state: Mutex<MapState>,
    events: broadcast::Sender<RequestEvent>,
}

impl Aggregator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            state: Mutex::new(MapState::default()),
            events,
        }
    }

    pub fn add(&self, event: RequestEvent) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(event.bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(event.bytes_out, Ordering::Relaxed);

        {
            let mut state = self.state.lock().expect("metrics state lock poisoned");
            *state.codes.entry(event.code).or_insert(0) += 1;
            let host = state.hosts.entry(event.host.clone()).or_default();
            host.req += 1;
            host.bytes_in += event.bytes_in;
            host.bytes_out += event.bytes_out;
            if state.recent.len() == RECENT_CAP {
                state.recent.pop_front();
            }
            state.recent.push_back(event.clone());
        }

        // Lossy broadcast; no subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Snapshot {
            uptime_sec: self.started_at.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            codes: state.codes.clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            hosts: state.hosts.clone(),
        }
    }

    /// A live receiver plus the recent backlog for replay. Registering under
    /// the state lock keeps the two gap-free.
    pub fn subscribe(&self) -> (Vec<RequestEvent>, broadcast::Receiver<RequestEvent>) {
        let state = self.state.lock().expect("metrics state lock poisoned");
        let backlog = state.recent.iter().cloned().collect();
        (backlog, self.events.subscribe())
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}
