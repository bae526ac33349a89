use grammers_client::Client;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// one cached live connection.
///
/// `op_lock` serialises platform calls per client: whoever performs an
/// operation holds it for the operation's whole duration, which together
/// with the allocation lock gives the strict per-account ordering.
pub struct ClientEntry {
    pub client: Client,
    pub op_lock: Mutex<()>,
    last_used: std::sync::Mutex<Instant>,
}

impl ClientEntry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            op_lock: Mutex::new(()),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

/// keyed map of live clients with single-writer discipline per key; a
/// janitor closes entries idle past the grace period
pub struct ClientRegistry {
    entries: Mutex<HashMap<String, Arc<ClientEntry>>>,
    idle_grace: Duration,
}

impl ClientRegistry {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_grace,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ClientEntry>> {
        let entries = self.entries.lock().await;
        entries.get(session_id).map(|entry| {
            entry.touch();
            entry.clone()
        })
    }

    pub async fn insert(&self, session_id: &str, client: Client) -> Arc<ClientEntry> {
        let entry = Arc::new(ClientEntry::new(client));
        let mut entries = self.entries.lock().await;
        entries.insert(session_id.to_string(), entry.clone());
        entry
    }

    /// dropping the entry closes the underlying connection once in-flight
    /// operations finish with their handles
    pub async fn remove(&self, session_id: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(session_id).is_some() {
            info!("Closed cached client for session {}", session_id);
        }
    }

    /// evicts entries idle past the grace period; returns how many went
    pub async fn sweep_idle(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let grace = self.idle_grace;
        entries.retain(|_, entry| entry.idle_for() < grace);
        let evicted = before - entries.len();
        if evicted > 0 {
            info!("Client janitor closed {} idle connection(s)", evicted);
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// periodic sweep; spawn once at startup
    pub async fn run_janitor(self: Arc<Self>) {
        let interval = self.idle_grace.min(Duration::from_secs(60));
        loop {
            tokio::time::sleep(interval).await;
            self.sweep_idle().await;
        }
    }
}
