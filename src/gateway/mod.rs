pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::dispatch::DispatchEngine;
use crate::error::DispatchError;
use crate::gateway::protocol::{InboundEvent, LocationReport, OrderResponse, OutboundEvent};
use crate::models::courier::CourierId;
use crate::observability::events::ExpiryCause;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("invalid location")]
    InvalidLocation,

    #[error("session is not registered as {0}")]
    Unbound(CourierId),

    #[error("session already registered as {0}")]
    AlreadyBound(CourierId),
}

/// One courier socket. Unbound until its first `shopper-register`.
pub struct Session {
    handle: ConnectionHandle,
    courier_id: Option<CourierId>,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            courier_id: None,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.handle.id
    }

    pub fn courier_id(&self) -> Option<&CourierId> {
        self.courier_id.as_ref()
    }

    /// Writes straight to this socket, whether or not it is bound.
    pub fn reply(&self, event: OutboundEvent) {
        if !self.handle.push(event) {
            debug!(connection_id = %self.handle.id, "session reply dropped");
        }
    }
}

#[async_trait]
pub trait CourierEventHandler: Send + Sync {
    async fn on_register(&self, session: &mut Session, report: LocationReport) -> Result<(), SessionError>;
    async fn on_location_update(&self, session: &Session, report: LocationReport) -> Result<(), SessionError>;
    async fn on_accept(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError>;
    async fn on_reject(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError>;
    async fn on_delivered(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError>;
    fn on_heartbeat(&self, session: &Session);
    async fn on_disconnect(&self, session: &Session);
}

/// Translates courier frames into engine calls.
pub struct SessionGateway {
    engine: Arc<DispatchEngine>,
    registry: Arc<ConnectionRegistry>,
}

impl SessionGateway {
    pub fn new(engine: Arc<DispatchEngine>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Runs one inbound frame. Failures go back to the socket as `error`
    /// frames; late accept and reject answers were already told
    /// `offer-unavailable` by the engine.
    pub async fn handle(&self, session: &mut Session, event: InboundEvent) {
        let responds_itself = matches!(event, InboundEvent::Accept(_) | InboundEvent::Reject(_));

        let result = match event {
            InboundEvent::ShopperRegister(report) => self.on_register(session, report).await,
            InboundEvent::LocationUpdate(report) => self.on_location_update(session, report).await,
            InboundEvent::Accept(response) => self.on_accept(session, response).await,
            InboundEvent::Reject(response) => self.on_reject(session, response).await,
            InboundEvent::OrderDelivered(response) => self.on_delivered(session, response).await,
        };

        if let Err(err) = result {
            if responds_itself && matches!(err, SessionError::Dispatch(_)) {
                return;
            }
            session.reply(OutboundEvent::Error {
                message: err.to_string(),
            });
        }
    }

    fn bound(&self, session: &Session, user_id: &CourierId) -> Result<CourierId, SessionError> {
        match session.courier_id() {
            Some(bound) if bound == user_id && self.registry.is_current(bound, session.connection_id()) => {
                self.registry.touch(bound, session.connection_id());
                Ok(bound.clone())
            }
            _ => Err(SessionError::Unbound(user_id.clone())),
        }
    }

    /// Drops couriers whose heartbeat lapsed or whose socket is gone.
    pub async fn sweep_stale(&self) -> usize {
        let mut dropped = 0;
        for (courier_id, connection_id) in self.registry.stale() {
            if self
                .engine
                .disconnect(&courier_id, Some(connection_id), ExpiryCause::Disconnected)
                .await
            {
                warn!(courier_id = %courier_id, "courier liveness lapsed");
                dropped += 1;
            }
        }
        dropped
    }
}

#[async_trait]
impl CourierEventHandler for SessionGateway {
    async fn on_register(&self, session: &mut Session, report: LocationReport) -> Result<(), SessionError> {
        if let Some(bound) = session.courier_id()
            && *bound != report.user_id
        {
            return Err(SessionError::AlreadyBound(bound.clone()));
        }
        if !report.location.is_valid() {
            return Err(SessionError::InvalidLocation);
        }

        self.engine
            .register(&report.user_id, report.location, session.handle.clone())
            .await?;
        session.courier_id = Some(report.user_id);
        Ok(())
    }

    async fn on_location_update(&self, session: &Session, report: LocationReport) -> Result<(), SessionError> {
        let courier_id = self.bound(session, &report.user_id)?;
        if !report.location.is_valid() {
            return Err(SessionError::InvalidLocation);
        }
        self.engine.update_location(&courier_id, report.location)?;
        Ok(())
    }

    async fn on_accept(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError> {
        let courier_id = self.bound(session, &response.user_id)?;
        self.engine.accept(&courier_id, response.order_id).await?;
        Ok(())
    }

    async fn on_reject(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError> {
        let courier_id = self.bound(session, &response.user_id)?;
        self.engine.reject(&courier_id, response.order_id).await?;
        Ok(())
    }

    async fn on_delivered(&self, session: &Session, response: OrderResponse) -> Result<(), SessionError> {
        let courier_id = self.bound(session, &response.user_id)?;
        self.engine
            .complete_delivery(&courier_id, response.order_id)
            .await?;
        Ok(())
    }

    fn on_heartbeat(&self, session: &Session) {
        if let Some(courier_id) = session.courier_id() {
            self.registry.touch(courier_id, session.connection_id());
        }
    }

    async fn on_disconnect(&self, session: &Session) {
        let Some(courier_id) = session.courier_id() else {
            return;
        };
        self.engine
            .disconnect(courier_id, Some(session.connection_id()), ExpiryCause::Disconnected)
            .await;
    }
}

pub async fn run_liveness_sweeper(gateway: Arc<SessionGateway>, every: Duration) {
    info!(interval_ms = every.as_millis() as u64, "liveness sweeper started");

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        gateway.sweep_stale().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{Session, SessionError};
    use crate::config::Config;
    use crate::engine::dispatch::run_dispatch_workers;
    use crate::gateway::CourierEventHandler;
    use crate::gateway::protocol::{InboundEvent, LocationReport, OrderResponse, OutboundEvent};
    use crate::ledger::store::InMemoryStore;
    use crate::models::courier::{CourierId, CourierStatus, GeoPoint};
    use crate::observability::events::{DispatchEvent, ExpiryCause, RecordingSink};
    use crate::registry::ConnectionHandle;
    use crate::state::AppState;

    fn report(user: &str) -> LocationReport {
        LocationReport {
            user_id: CourierId::from(user),
            location: GeoPoint::new(0.0, 0.0),
        }
    }

    fn recorded(config: Config) -> (AppState, Arc<RecordingSink>) {
        let events = Arc::new(RecordingSink::default());
        let (state, rx) = AppState::with_sink(
            config,
            Arc::new(InMemoryStore::default()),
            Some(events.clone()),
        );
        tokio::spawn(run_dispatch_workers(state.engine.clone(), rx, 1));
        (state, events)
    }

    async fn next_offered_order(outbound: &mut mpsc::Receiver<OutboundEvent>) -> Uuid {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), outbound.recv())
                .await
                .unwrap()
                .unwrap();
            if let OutboundEvent::NewOrder { order, .. } = event {
                return order.id;
            }
        }
    }

    fn expired_by_disconnect(events: &RecordingSink, order_id: Uuid) -> bool {
        events.events().iter().any(|event| {
            matches!(
                event,
                DispatchEvent::OfferExpired {
                    cause: ExpiryCause::Disconnected,
                    order_ids,
                    ..
                } if order_ids.contains(&order_id)
            )
        })
    }

    #[tokio::test]
    async fn register_binds_session_and_marks_available() {
        let (state, _rx) = AppState::new(Config::default(), Arc::new(InMemoryStore::default()));
        let (handle, mut outbound) = ConnectionHandle::channel(8);
        let mut session = Session::new(handle);

        state
            .gateway
            .handle(&mut session, InboundEvent::ShopperRegister(report("s1")))
            .await;

        assert_eq!(session.courier_id(), Some(&CourierId::from("s1")));
        assert_eq!(
            outbound.recv().await,
            Some(OutboundEvent::Registered {
                user_id: CourierId::from("s1"),
            })
        );
        assert_eq!(state.index.status(&CourierId::from("s1")), Some(CourierStatus::Available));
    }

    #[tokio::test]
    async fn frames_for_another_user_are_refused() {
        let (state, _rx) = AppState::new(Config::default(), Arc::new(InMemoryStore::default()));
        let (handle, _outbound) = ConnectionHandle::channel(8);
        let mut session = Session::new(handle);

        let unbound = state.gateway.on_location_update(&session, report("s1")).await;
        assert_eq!(unbound, Err(SessionError::Unbound(CourierId::from("s1"))));

        state.gateway.on_register(&mut session, report("s1")).await.unwrap();
        let spoofed = state
            .gateway
            .on_accept(
                &session,
                OrderResponse {
                    user_id: CourierId::from("s2"),
                    order_id: uuid::Uuid::new_v4(),
                },
            )
            .await;
        assert_eq!(spoofed, Err(SessionError::Unbound(CourierId::from("s2"))));

        let rebind = state.gateway.on_register(&mut session, report("s2")).await;
        assert_eq!(rebind, Err(SessionError::AlreadyBound(CourierId::from("s1"))));
    }

    #[tokio::test]
    async fn invalid_location_gets_error_frame() {
        let (state, _rx) = AppState::new(Config::default(), Arc::new(InMemoryStore::default()));
        let (handle, mut outbound) = ConnectionHandle::channel(8);
        let mut session = Session::new(handle);

        let mut bad = report("s1");
        bad.location = GeoPoint::new(123.0, 0.0);
        state
            .gateway
            .handle(&mut session, InboundEvent::ShopperRegister(bad))
            .await;

        assert!(matches!(outbound.recv().await, Some(OutboundEvent::Error { .. })));
        assert!(session.courier_id().is_none());
    }

    #[tokio::test]
    async fn disconnect_of_replaced_session_keeps_new_one() {
        let (state, _rx) = AppState::new(Config::default(), Arc::new(InMemoryStore::default()));
        let (first_handle, _first_rx) = ConnectionHandle::channel(8);
        let (second_handle, _second_rx) = ConnectionHandle::channel(8);
        let mut first = Session::new(first_handle);
        let mut second = Session::new(second_handle);

        state.gateway.on_register(&mut first, report("s1")).await.unwrap();
        state.gateway.on_register(&mut second, report("s1")).await.unwrap();
        state.gateway.on_disconnect(&first).await;

        assert!(state.registry.is_current(&CourierId::from("s1"), second.connection_id()));
        assert_eq!(state.index.status(&CourierId::from("s1")), Some(CourierStatus::Available));
    }

    #[tokio::test]
    async fn lapsed_heartbeat_expires_outstanding_offer() {
        let mut config = Config::default();
        config.session.heartbeat_timeout = Duration::from_millis(100);
        let (state, events) = recorded(config);
        let courier = CourierId::from("s1");
        let (handle, mut outbound) = ConnectionHandle::channel(8);
        let mut session = Session::new(handle);

        state.gateway.on_register(&mut session, report("s1")).await.unwrap();
        let order = state
            .engine
            .create_order(GeoPoint::new(0.0, 0.001), None)
            .await
            .unwrap();
        assert_eq!(next_offered_order(&mut outbound).await, order.id);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(state.gateway.sweep_stale().await, 1);

        assert!(!state.registry.contains(&courier));
        assert!(state.index.get(&courier).is_none());
        assert!(state.engine.active_offer(&courier).is_none());
        assert!(state.ledger.get(order.id).await.unwrap().state.is_pending());
        assert!(expired_by_disconnect(&events, order.id));
    }

    #[tokio::test]
    async fn socket_close_expires_outstanding_offer() {
        let (state, events) = recorded(Config::default());
        let courier = CourierId::from("s1");
        let (handle, mut outbound) = ConnectionHandle::channel(8);
        let mut session = Session::new(handle);

        state.gateway.on_register(&mut session, report("s1")).await.unwrap();
        let order = state
            .engine
            .create_order(GeoPoint::new(0.0, 0.001), None)
            .await
            .unwrap();
        assert_eq!(next_offered_order(&mut outbound).await, order.id);

        state.gateway.on_disconnect(&session).await;

        assert!(!state.registry.contains(&courier));
        assert!(state.ledger.get(order.id).await.unwrap().state.is_pending());
        assert!(expired_by_disconnect(&events, order.id));
        assert_eq!(state.gateway.sweep_stale().await, 0);
    }
}
