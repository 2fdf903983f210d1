use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events: one channel per table plus one for the
/// whole restaurant. Dashboards subscribe; the engine never waits on them.
pub struct NotifyHub {
    tables: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one table. Creates the channel if needed.
    pub fn subscribe(&self, table_id: Ulid) -> broadcast::Receiver<Event> {
        self.tables
            .entry(table_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Fan an event out. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.all.send(event.clone());
        if let Event::ReservationMoved { from_table, to_table, .. } = event
            && from_table != to_table
            && let Some(sender) = self.tables.get(from_table)
        {
            let _ = sender.send(event.clone());
        }
        if let Some(table_id) = event.table_id()
            && let Some(sender) = self.tables.get(&table_id)
        {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a table's channel once the table is gone.
    pub fn remove(&self, table_id: &Ulid) {
        self.tables.remove(table_id);
    }
}
