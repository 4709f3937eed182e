use std::sync::Arc;
use std::time::{Duration, Instant};

use classroom_store::{MemoryStore, StoreHandle, StoreMode};
use tracing::warn;

use crate::accounting::{Accounting, ClassAccounting};
use crate::config::{AppConfig, StoreBackend};
use crate::keys::KeySpace;
use crate::live_state::LiveState;
use crate::notify::RoomNotifier;
use crate::presence::PresenceEngine;
use crate::replay::PageEvents;
use crate::room::RoomActions;
use crate::scheduler::AttendanceScheduler;
use crate::store_redis::RedisStore;

/// Tunables shared by the relay components.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub instance_id: String,
    pub room_ttl: Duration,
    pub block_timeout: Duration,
    pub attendance_grace: Duration,
    pub sweep_lock_ttl: Duration,
}

impl From<&AppConfig> for RelaySettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            instance_id: cfg.instance_id.clone(),
            room_ttl: cfg.room_ttl,
            block_timeout: cfg.block_timeout,
            attendance_grace: cfg.attendance_grace,
            sweep_lock_ttl: cfg.sweep_lock_ttl,
        }
    }
}

pub async fn build_store(cfg: &AppConfig) -> anyhow::Result<StoreHandle> {
    match cfg.store_backend {
        StoreBackend::Memory => {
            warn!("using the in-process store; room state is not shared between instances");
            Ok(Arc::new(MemoryStore::new(StoreMode::Single)))
        }
        StoreBackend::Redis => {
            let store =
                RedisStore::connect(&cfg.redis_url, &cfg.redis_cluster_nodes, cfg.block_timeout)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

/// Every operation the client-facing surface calls, wired over one store.
#[derive(Clone)]
pub struct Relay {
    pub presence: PresenceEngine,
    pub room: RoomActions,
    pub notifier: RoomNotifier,
    pub pages: PageEvents,
    pub live: LiveState,
    pub scheduler: AttendanceScheduler,
}

impl Relay {
    pub fn new(store: StoreHandle, accounting: Arc<dyn Accounting>, settings: &RelaySettings) -> Self {
        let keys = KeySpace::new(settings.room_ttl);
        let accounting = ClassAccounting::new(store.clone(), keys.clone(), accounting);
        let live = LiveState::new(store.clone(), keys.clone(), settings.block_timeout);
        let scheduler = AttendanceScheduler::new(
            store.clone(),
            keys.clone(),
            accounting.clone(),
            settings.instance_id.clone(),
            settings.attendance_grace,
            settings.sweep_lock_ttl,
        );
        Self {
            presence: PresenceEngine::new(
                store.clone(),
                keys.clone(),
                live.clone(),
                accounting,
                scheduler.clone(),
            ),
            room: RoomActions::new(store.clone(), keys.clone(), live.clone()),
            notifier: RoomNotifier::new(store.clone(), keys.clone(), settings.block_timeout),
            pages: PageEvents::new(store, keys, settings.block_timeout),
            live,
            scheduler,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    instance_id: String,
    store_mode: StoreMode,
    relay: Relay,
}

impl AppState {
    pub fn new(instance_id: String, store_mode: StoreMode, relay: Relay) -> Self {
        Self {
            start: Instant::now(),
            instance_id,
            store_mode,
            relay,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store_mode(&self) -> StoreMode {
        self.store_mode
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }
}
