mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast;

use crate::auth::RoomTicket;
use crate::error::CoreResult;

pub use types::{EventMetadata, EventType, OutboundEvent, Room, WireEvent};

const ROOM_BUFFER: usize = 256;

/// Fan-out beyond this process. Horizontally scaled deployments back this
/// with their pub/sub of choice; each instance re-publishes what it hears
/// into its local rooms, giving at-least-once delivery overall.
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn forward(&self, room: Room, event: WireEvent) -> anyhow::Result<()>;
}

/// Single-process backplane: nothing to forward to.
pub struct LoopbackBackplane;

#[async_trait]
impl Backplane for LoopbackBackplane {
    async fn forward(&self, _room: Room, _event: WireEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Room-scoped broadcaster. One channel per room, created lazily on first
/// subscribe or publish; FIFO within a room, best-effort across rooms.
pub struct Publisher {
    rooms: Mutex<HashMap<Room, broadcast::Sender<WireEvent>>>,
    backplane: Arc<dyn Backplane>,
}

impl Publisher {
    pub fn new(backplane: Arc<dyn Backplane>) -> Self {
        Publisher {
            rooms: Mutex::new(HashMap::new()),
            backplane,
        }
    }

    pub fn in_process() -> Self {
        Self::new(Arc::new(LoopbackBackplane))
    }

    fn sender_for(&self, room: Room) -> broadcast::Sender<WireEvent> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rooms
            .entry(room)
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .clone()
    }

    /// Subscribes to a room. The ticket is only mintable through the
    /// authorization gate, so an unauthenticated or non-member subscriber
    /// cannot reach this far.
    pub fn subscribe(&self, room: Room, _ticket: RoomTicket) -> broadcast::Receiver<WireEvent> {
        self.sender_for(room).subscribe()
    }

    /// Stream view of a subscription, for transports that forward rooms as
    /// async streams. Lagged receivers observe an error item and continue,
    /// which is where the at-least-once guarantee hands over to reconnect.
    pub fn subscribe_stream(
        &self,
        room: Room,
        ticket: RoomTicket,
    ) -> tokio_stream::wrappers::BroadcastStream<WireEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe(room, ticket))
    }

    /// Publishes one event to its local room and the backplane. Failures are
    /// logged, never surfaced: delivery is at-least-once via reconnect, and
    /// the mutation that produced the event has already committed.
    pub async fn publish(&self, outbound: OutboundEvent) {
        let OutboundEvent { room, event } = outbound;
        let receivers = self.sender_for(room).send(event.clone()).unwrap_or(0);
        debug!(
            "published {} to {room} ({receivers} local subscriber(s))",
            event.event_type
        );
        if let Err(err) = self.backplane.forward(room, event).await {
            warn!("backplane publish to {room} failed: {err:#}");
        }
    }

    /// Drains a post-commit event buffer in order.
    pub async fn publish_all(&self, events: Vec<OutboundEvent>) {
        for outbound in events {
            self.publish(outbound).await;
        }
    }

    /// Delivers an event heard on the backplane into the local room without
    /// re-forwarding it.
    pub fn deliver_remote(&self, room: Room, event: WireEvent) -> CoreResult<()> {
        let _ = self.sender_for(room).send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::auth::{authorize_subscription, Role};
    use crate::context::RequestContext;

    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    fn ticket(campaign: Uuid) -> RoomTicket {
        authorize_subscription(Some(Role::Player), Uuid::new_v4(), campaign).unwrap()
    }

    fn event(ctx: &RequestContext, event_type: EventType) -> WireEvent {
        WireEvent::new(event_type, json!({"n": 1}), ctx)
    }

    #[tokio::test]
    async fn events_reach_room_subscribers_in_order() {
        let publisher = Publisher::in_process();
        let campaign = Uuid::new_v4();
        let room = Room::Campaign(campaign);
        let mut receiver = publisher.subscribe(room, ticket(campaign));

        let ctx = ctx();
        publisher
            .publish(OutboundEvent {
                room,
                event: event(&ctx, EventType::WorldTimeChanged),
            })
            .await;
        publisher
            .publish(OutboundEvent {
                room,
                event: event(&ctx, EventType::EntityUpdated),
            })
            .await;

        assert_eq!(
            receiver.recv().await.unwrap().event_type,
            EventType::WorldTimeChanged
        );
        assert_eq!(
            receiver.recv().await.unwrap().event_type,
            EventType::EntityUpdated
        );
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let publisher = Publisher::in_process();
        let campaign = Uuid::new_v4();
        let settlement = Uuid::new_v4();
        let mut campaign_rx =
            publisher.subscribe(Room::Campaign(campaign), ticket(campaign));
        let mut settlement_rx =
            publisher.subscribe(Room::Settlement(settlement), ticket(campaign));

        let ctx = ctx();
        publisher
            .publish(OutboundEvent {
                room: Room::Settlement(settlement),
                event: event(&ctx, EventType::SettlementUpdated),
            })
            .await;

        assert_eq!(
            settlement_rx.recv().await.unwrap().event_type,
            EventType::SettlementUpdated
        );
        assert!(campaign_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let publisher = Publisher::in_process();
        let ctx = ctx();
        publisher
            .publish(OutboundEvent {
                room: Room::Campaign(Uuid::new_v4()),
                event: event(&ctx, EventType::EntityUpdated),
            })
            .await;
    }

    #[tokio::test]
    async fn backplane_sees_every_publish() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl Backplane for Counting {
            async fn forward(&self, _room: Room, _event: WireEvent) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let publisher = Publisher::new(counter.clone());
        let ctx = ctx();
        let room = Room::Campaign(Uuid::new_v4());
        publisher
            .publish_all(vec![
                OutboundEvent {
                    room,
                    event: event(&ctx, EventType::EntityUpdated),
                },
                OutboundEvent {
                    room,
                    event: event(&ctx, EventType::StateInvalidated),
                },
            ])
            .await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remote_deliveries_reach_local_rooms_without_reforwarding() {
        struct Failing;

        #[async_trait]
        impl Backplane for Failing {
            async fn forward(&self, _room: Room, _event: WireEvent) -> anyhow::Result<()> {
                anyhow::bail!("backplane down")
            }
        }

        let publisher = Publisher::new(Arc::new(Failing));
        let campaign = Uuid::new_v4();
        let room = Room::Campaign(campaign);
        let mut receiver = publisher.subscribe(room, ticket(campaign));

        let ctx = ctx();
        // local publish still delivers locally even when the backplane fails
        publisher
            .publish(OutboundEvent {
                room,
                event: event(&ctx, EventType::EntityUpdated),
            })
            .await;
        assert_eq!(
            receiver.recv().await.unwrap().event_type,
            EventType::EntityUpdated
        );

        // and a remote event is delivered without touching the backplane
        publisher
            .deliver_remote(room, event(&ctx, EventType::StateInvalidated))
            .unwrap();
        assert_eq!(
            receiver.recv().await.unwrap().event_type,
            EventType::StateInvalidated
        );
    }
}
