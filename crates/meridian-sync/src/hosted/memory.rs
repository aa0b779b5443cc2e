//! In-process hosted storage service.
//!
//! Rooms live as long as the service and are shared by every client that
//! enters them, so several backends on one service replicate to each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use meridian_shared::{TableName, UserIdentity};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::client::{HostedClient, HostedEvent, HostedRoom, RoomCredentials, RoomState, StorageState};
use crate::error::{Result, SyncError};

#[derive(Clone, Default)]
pub struct MemoryHostedService {
    inner: Arc<Mutex<ServiceState>>,
}

#[derive(Default)]
struct ServiceState {
    rooms: HashMap<String, RoomData>,
    unavailable: bool,
    required: Option<RoomCredentials>,
    next_id: u64,
}

#[derive(Default)]
struct RoomData {
    maps: HashMap<TableName, BTreeMap<String, Value>>,
    members: BTreeMap<String, Member>,
}

struct Member {
    presence: Option<UserIdentity>,
    events: broadcast::Sender<HostedEvent>,
}

impl RoomData {
    fn notify_others(&self, except: &str, event: HostedEvent) {
        for (id, member) in &self.members {
            if id != except {
                let _ = member.events.send(event.clone());
            }
        }
    }
}

impl MemoryHostedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept clients presenting `credentials`.
    pub fn require_credentials(&self, credentials: RoomCredentials) {
        self.state().required = Some(credentials);
    }

    /// Unavailable services refuse to let clients enter.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Write an entry directly into a room's storage, as another client would.
    pub fn seed(&self, room_id: &str, table: TableName, id: &str, value: Value) {
        let mut state = self.state();
        let room = state.rooms.entry(room_id.to_string()).or_default();
        room.maps.entry(table).or_default().insert(id.to_string(), value);
        room.notify_others("", HostedEvent::MapChanged { table });
    }

    pub fn map(&self, room_id: &str, table: TableName) -> BTreeMap<String, Value> {
        self.state()
            .rooms
            .get(room_id)
            .and_then(|room| room.maps.get(&table))
            .cloned()
            .unwrap_or_default()
    }

    pub fn members(&self, room_id: &str) -> usize {
        self.state()
            .rooms
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// Deliver `event` to every client in the room.
    pub fn emit(&self, room_id: &str, event: HostedEvent) {
        if let Some(room) = self.state().rooms.get(room_id) {
            room.notify_others("", event);
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HostedClient for MemoryHostedService {
    async fn enter_room(
        &self,
        room_id: &str,
        credentials: RoomCredentials,
        presence: Option<UserIdentity>,
    ) -> Result<Box<dyn HostedRoom>> {
        let mut state = self.state();
        if state.unavailable {
            return Err(SyncError::Hosted("service unavailable".into()));
        }
        if let Some(required) = &state.required {
            if *required != credentials {
                return Err(SyncError::Auth("credentials rejected".into()));
            }
        }

        state.next_id += 1;
        let connection_id = format!("hosted-{}", state.next_id);
        let (events, _) = broadcast::channel(256);

        let room = state.rooms.entry(room_id.to_string()).or_default();
        room.members.insert(
            connection_id.clone(),
            Member {
                presence,
                events: events.clone(),
            },
        );
        room.notify_others(&connection_id, HostedEvent::OthersChanged);
        debug!(room = %room_id, connection_id = %connection_id, "Entered hosted room");

        Ok(Box::new(MemoryRoom {
            service: self.clone(),
            room_id: room_id.to_string(),
            connection_id,
            events,
        }))
    }
}

struct MemoryRoom {
    service: MemoryHostedService,
    room_id: String,
    connection_id: String,
    events: broadcast::Sender<HostedEvent>,
}

impl MemoryRoom {
    fn with_room<T>(&self, f: impl FnOnce(&mut RoomData) -> T) -> Result<T> {
        let mut state = self.service.state();
        let room = state
            .rooms
            .get_mut(&self.room_id)
            .filter(|room| room.members.contains_key(&self.connection_id))
            .ok_or_else(|| SyncError::Hosted("not in room".into()))?;
        Ok(f(room))
    }
}

#[async_trait]
impl HostedRoom for MemoryRoom {
    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn events(&self) -> broadcast::Receiver<HostedEvent> {
        self.events.subscribe()
    }

    async fn storage_loaded(&self) -> Result<()> {
        self.with_room(|_| ())?;
        let _ = self.events.send(HostedEvent::Room(RoomState::Connected));
        let _ = self.events.send(HostedEvent::Storage(StorageState::Synchronized));
        Ok(())
    }

    async fn map_snapshot(&self, table: TableName) -> Result<BTreeMap<String, Value>> {
        self.with_room(|room| room.maps.get(&table).cloned().unwrap_or_default())
    }

    async fn set_entries(&self, table: TableName, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let me = self.connection_id.clone();
        self.with_room(|room| {
            room.maps.entry(table).or_default().extend(entries);
            room.notify_others(&me, HostedEvent::MapChanged { table });
        })
    }

    async fn delete_entry(&self, table: TableName, id: &str) -> Result<()> {
        let me = self.connection_id.clone();
        self.with_room(|room| {
            let removed = room
                .maps
                .get_mut(&table)
                .and_then(|map| map.remove(id))
                .is_some();
            if removed {
                room.notify_others(&me, HostedEvent::MapChanged { table });
            }
        })
    }

    fn update_presence(&self, identity: UserIdentity) {
        let me = self.connection_id.clone();
        let _ = self.with_room(|room| {
            if let Some(member) = room.members.get_mut(&me) {
                member.presence = Some(identity);
            }
            room.notify_others(&me, HostedEvent::OthersChanged);
        });
    }

    fn others(&self) -> Vec<(String, UserIdentity)> {
        self.with_room(|room| {
            room.members
                .iter()
                .filter(|(id, _)| **id != self.connection_id)
                .filter_map(|(id, member)| Some((id.clone(), member.presence.clone()?)))
                .collect()
        })
        .unwrap_or_default()
    }

    async fn leave(&self) {
        let mut state = self.service.state();
        if let Some(room) = state.rooms.get_mut(&self.room_id) {
            if room.members.remove(&self.connection_id).is_some() {
                room.notify_others(&self.connection_id, HostedEvent::OthersChanged);
                debug!(connection_id = %self.connection_id, "Left hosted room");
            }
        }
    }
}
