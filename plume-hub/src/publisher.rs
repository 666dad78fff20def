use std::collections::HashMap;
use std::sync::RwLock;

use plume_core::{Publication, SensorId};
use tokio::sync::watch;

/// Fan-out of per-sensor results to subscribers.
///
/// Each sensor has a `watch` channel, so a subscriber always sees the latest
/// publication and never a backlog. Subscribing to a sensor that has not
/// been polled yet yields [`Publication::Pending`].
#[derive(Default)]
pub struct Publisher {
    channels: RwLock<HashMap<SensorId, watch::Sender<Publication>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sensor_id: SensorId) -> watch::Receiver<Publication> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(sensor_id)
            .or_insert_with(|| watch::channel(Publication::Pending).0)
            .subscribe()
    }

    pub fn publish(&self, sensor_id: SensorId, publication: Publication) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        match channels.get(&sensor_id) {
            Some(sender) => {
                sender.send_replace(publication);
            }
            None => {
                channels.insert(sensor_id, watch::channel(publication).0);
            }
        }
    }

    pub fn current(&self, sensor_id: SensorId) -> Option<Publication> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(&sensor_id).map(|sender| sender.borrow().clone())
    }

    /// Latest publication of every known sensor, ordered by id.
    pub fn snapshot(&self) -> Vec<(SensorId, Publication)> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = channels
            .iter()
            .map(|(id, sender)| (*id, sender.borrow().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Forget a sensor. Dropping the sender closes every receiver.
    pub fn remove(&self, sensor_id: SensorId) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.remove(&sensor_id);
    }
}
