use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::gateway::protocol::OutboundEvent;
use crate::models::courier::CourierId;

/// Outbound half of one courier socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    outbound: mpsc::Sender<OutboundEvent>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
        }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Pushes directly to this socket, bypassing courier lookup.
    pub fn push(&self, event: OutboundEvent) -> bool {
        self.outbound.try_send(event).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

struct Entry {
    handle: ConnectionHandle,
    last_seen: Instant,
}

pub struct ConnectionRegistry {
    entries: DashMap<CourierId, Entry>,
    liveness_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            liveness_timeout,
        }
    }

    /// Binds `handle` to the courier, replacing any previous connection.
    /// Returns the replaced handle on reconnect.
    pub fn register(&self, courier_id: &CourierId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let now = Instant::now();
        match self.entries.get_mut(courier_id) {
            Some(mut entry) => {
                let previous = std::mem::replace(&mut entry.handle, handle);
                entry.last_seen = now;
                Some(previous)
            }
            None => {
                self.entries.insert(
                    courier_id.clone(),
                    Entry {
                        handle,
                        last_seen: now,
                    },
                );
                None
            }
        }
    }

    pub fn unregister(&self, courier_id: &CourierId) -> bool {
        self.entries.remove(courier_id).is_some()
    }

    /// Removes the courier only while `connection_id` is still its current socket.
    pub fn unregister_connection(&self, courier_id: &CourierId, connection_id: Uuid) -> bool {
        self.entries
            .remove_if(courier_id, |_, entry| entry.handle.id == connection_id)
            .is_some()
    }

    /// Refreshes liveness for a location report. Position itself lives in the
    /// geo index.
    pub fn mark_seen(&self, courier_id: &CourierId) -> Result<(), DispatchError> {
        let mut entry = self
            .entries
            .get_mut(courier_id)
            .ok_or_else(|| DispatchError::NotRegistered(courier_id.clone()))?;
        entry.last_seen = Instant::now();
        Ok(())
    }

    pub fn connection_id(&self, courier_id: &CourierId) -> Option<Uuid> {
        self.entries.get(courier_id).map(|entry| entry.handle.id)
    }

    /// Records a liveness signal. False when `connection_id` is not the courier's
    /// current connection.
    pub fn touch(&self, courier_id: &CourierId, connection_id: Uuid) -> bool {
        match self.entries.get_mut(courier_id) {
            Some(mut entry) if entry.handle.id == connection_id => {
                entry.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, courier_id: &CourierId, connection_id: Uuid) -> bool {
        self.entries
            .get(courier_id)
            .is_some_and(|entry| entry.handle.id == connection_id)
    }

    /// Queues `event` for the courier's socket. A lapsed heartbeat, a closed
    /// socket or a full outbound buffer all count as `NotConnected`.
    pub fn send(&self, courier_id: &CourierId, event: OutboundEvent) -> Result<(), DispatchError> {
        let not_connected = || DispatchError::NotConnected(courier_id.clone());

        let entry = self.entries.get(courier_id).ok_or_else(not_connected)?;
        if entry.last_seen.elapsed() > self.liveness_timeout || entry.handle.is_closed() {
            return Err(not_connected());
        }

        entry.handle.outbound.try_send(event).map_err(|err| {
            debug!(courier_id = %courier_id, error = %err, "outbound push failed");
            not_connected()
        })
    }

    /// Couriers whose last liveness signal is older than the timeout or whose
    /// socket is already gone.
    pub fn stale(&self) -> Vec<(CourierId, Uuid)> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.last_seen.elapsed() > self.liveness_timeout || entry.handle.is_closed()
            })
            .map(|entry| (entry.key().clone(), entry.handle.id))
            .collect()
    }

    pub fn contains(&self, courier_id: &CourierId) -> bool {
        self.entries.contains_key(courier_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConnectionHandle, ConnectionRegistry};
    use crate::error::DispatchError;
    use crate::gateway::protocol::OutboundEvent;
    use crate::models::courier::CourierId;

    fn registered() -> OutboundEvent {
        OutboundEvent::Registered {
            user_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn send_reaches_registered_connection() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let (handle, mut rx) = ConnectionHandle::channel(8);
        let connection_id = handle.id;
        let id = CourierId::from("s1");
        assert!(registry.register(&id, handle).is_none());

        registry.send(&id, registered()).unwrap();
        assert_eq!(rx.recv().await, Some(registered()));

        registry.mark_seen(&id).unwrap();
        assert_eq!(registry.connection_id(&id), Some(connection_id));
    }

    #[test]
    fn unknown_courier_is_not_connected() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let id = CourierId::from("ghost");

        assert_eq!(
            registry.send(&id, registered()),
            Err(DispatchError::NotConnected(id.clone()))
        );
        assert_eq!(
            registry.mark_seen(&id),
            Err(DispatchError::NotRegistered(id))
        );
    }

    #[test]
    fn dropped_socket_is_not_connected() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let (handle, rx) = ConnectionHandle::channel(8);
        let id = CourierId::from("s1");
        registry.register(&id, handle);
        drop(rx);

        assert!(registry.send(&id, registered()).is_err());
        assert_eq!(registry.stale().len(), 1);
    }

    #[test]
    fn reconnect_replaces_handle_and_ignores_stale_close() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let id = CourierId::from("s1");
        let (first, _first_rx) = ConnectionHandle::channel(8);
        let first_id = first.id;
        let (second, _second_rx) = ConnectionHandle::channel(8);
        let second_id = second.id;

        registry.register(&id, first);
        let replaced = registry.register(&id, second).unwrap();
        assert_eq!(replaced.id, first_id);

        assert!(!registry.unregister_connection(&id, first_id));
        assert!(registry.is_current(&id, second_id));
        assert!(registry.unregister_connection(&id, second_id));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn lapsed_heartbeat_is_not_connected() {
        let registry = ConnectionRegistry::new(Duration::from_millis(0));
        let (handle, _rx) = ConnectionHandle::channel(8);
        let connection_id = handle.id;
        let id = CourierId::from("s1");
        registry.register(&id, handle);
        std::thread::sleep(Duration::from_millis(5));

        assert!(registry.send(&id, registered()).is_err());
        assert_eq!(registry.stale(), vec![(id, connection_id)]);
    }
}
