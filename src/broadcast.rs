/**
 * BROADCASTER - Diffusion des snapshots vers les abonnés connectés
 *
 * RÔLE :
 * Tient le registre des abonnés (connexions live) et pousse chaque nouveau
 * snapshot sur la file bornée de chacun, sans jamais bloquer sur un abonné
 * lent ou cassé.
 *
 * FONCTIONNEMENT :
 * - Une file bornée par abonné (drop-oldest en cas de débordement) :
 *   staleness bornée plutôt que mémoire non bornée
 * - Les débordements consécutifs comptent des strikes; au-delà du seuil,
 *   l'abonné est désabonné de force
 * - La livraison vers un abonné n'affecte jamais les autres
 *
 * UTILITÉ DANS VIGIL :
 * 🎯 Temps réel : chaque observateur converge vers le dernier snapshot
 * 🎯 Isolation : un consommateur bloqué ne dégrade ni l'aggregator ni ses pairs
 */

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::{Snapshot, WireMessage};

/// File sortante d'un abonné. Possédée par son seul abonné côté lecture;
/// le broadcaster n'y fait que des push non bloquants.
struct SubscriberQueue {
    messages: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
    closed: AtomicBool,
    strikes: AtomicU32,
    capacity: usize,
}

enum PushOutcome {
    Delivered,
    DroppedOldest,
    Closed,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            strikes: AtomicU32::new(0),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, msg: WireMessage) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let dropped = {
            let mut queue = self.messages.lock();
            let dropped = if queue.len() == self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(msg);
            dropped
        };
        self.notify.notify_one();
        if dropped {
            self.strikes.fetch_add(1, Ordering::AcqRel);
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Delivered
        }
    }

    async fn pop(&self) -> Option<WireMessage> {
        loop {
            if let Some(msg) = self.messages.lock().pop_front() {
                // l'abonné draine : il est vivant, on remet les strikes à zéro
                self.strikes.store(0, Ordering::Release);
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Poignée rendue à la couche de présentation. La drop (déconnexion HTTP)
/// désabonne proprement.
pub struct SubscriberHandle {
    pub id: Uuid,
    pub connected_at: OffsetDateTime,
    queue: Arc<SubscriberQueue>,
    broadcaster: Arc<Broadcaster>,
}

impl SubscriberHandle {
    /// None quand l'abonné a été désabonné (fermeture ou strikes dépassés).
    pub async fn recv(&self) -> Option<WireMessage> {
        self.queue.pop().await
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<Uuid, Arc<SubscriberQueue>>>,
    queue_capacity: usize,
    overflow_strikes: u32,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize, overflow_strikes: u32) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity,
            overflow_strikes: overflow_strikes.max(1),
        }
    }

    /// Enregistre un abonné et amorce sa file : message `connection`, puis
    /// `update` portant le dernier snapshot s'il existe.
    pub fn subscribe(self: &Arc<Self>, latest: Option<Arc<Snapshot>>) -> SubscriberHandle {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));

        queue.push(WireMessage::connection(id));
        if let Some(snapshot) = latest {
            queue.push(WireMessage::update(&snapshot));
        }

        self.subscribers.lock().insert(id, queue.clone());
        println!("[broadcast] subscriber {id} connected");

        SubscriberHandle {
            id,
            connected_at: OffsetDateTime::now_utc(),
            queue,
            broadcaster: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if let Some(queue) = self.subscribers.lock().remove(&id) {
            queue.close();
            println!("[broadcast] subscriber {id} disconnected");
        }
    }

    /// Pousse un `live_update` sur chaque file, sans bloquer. Une file pleine
    /// perd son plus ancien message; un abonné qui déborde trop longtemps est
    /// désabonné de force.
    pub fn notify(&self, snapshot: &Snapshot) {
        let msg = WireMessage::live_update(snapshot);
        let mut dead = Vec::new();

        {
            let subscribers = self.subscribers.lock();
            for (id, queue) in subscribers.iter() {
                match queue.push(msg.clone()) {
                    PushOutcome::Delivered => {}
                    PushOutcome::DroppedOldest => {
                        if queue.strikes.load(Ordering::Acquire) >= self.overflow_strikes {
                            dead.push(*id);
                        }
                    }
                    PushOutcome::Closed => dead.push(*id),
                }
            }
        }

        for id in dead {
            eprintln!("[broadcast] subscriber {id} unresponsive, forcing unsubscribe");
            self.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Derived, ThreatLevel, WireKind};
    use std::collections::BTreeMap;

    fn snapshot(sequence: u64) -> Snapshot {
        Snapshot {
            sequence,
            generated_at: OffsetDateTime::now_utc(),
            sections: BTreeMap::new(),
            derived: Derived {
                threat_level: ThreatLevel::Low,
                threat_score: 0,
                total_alerts: 0,
                critical_alerts: 0,
                high_alerts: 0,
                medium_alerts: 0,
                low_alerts: 0,
            },
        }
    }

    fn data_sequence(msg: &WireMessage) -> u64 {
        msg.data["sequence"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_primes_connection_then_update() {
        let broadcaster = Arc::new(Broadcaster::new(8, 4));
        let handle = broadcaster.subscribe(Some(Arc::new(snapshot(7))));

        let first = handle.recv().await.unwrap();
        assert_eq!(first.kind, WireKind::Connection);

        let second = handle.recv().await.unwrap();
        assert_eq!(second.kind, WireKind::Update);
        assert_eq!(data_sequence(&second), 7);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_first() {
        let broadcaster = Arc::new(Broadcaster::new(2, 100));
        let handle = broadcaster.subscribe(None); // file: [connection]

        broadcaster.notify(&snapshot(1)); // file: [connection, 1]
        broadcaster.notify(&snapshot(2)); // déborde: [1, 2]
        broadcaster.notify(&snapshot(3)); // déborde: [2, 3]

        let first = handle.recv().await.unwrap();
        assert_eq!(first.kind, WireKind::LiveUpdate);
        assert_eq!(data_sequence(&first), 2);

        let second = handle.recv().await.unwrap();
        assert_eq!(data_sequence(&second), 3);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_isolated_then_removed() {
        let broadcaster = Arc::new(Broadcaster::new(2, 3));
        let stalled = broadcaster.subscribe(None);
        let active = broadcaster.subscribe(None);
        assert_eq!(broadcaster.subscriber_count(), 2);

        assert_eq!(active.recv().await.unwrap().kind, WireKind::Connection);

        // stalled ne draine jamais : [connection] -> plein après notify 1,
        // puis 3 débordements consécutifs (notifies 2..4) -> désabonnement
        for seq in 1..=4 {
            broadcaster.notify(&snapshot(seq));
            // l'abonné actif reçoit chaque notify dans le tick
            let msg = active.recv().await.unwrap();
            assert_eq!(data_sequence(&msg), seq);
        }

        assert_eq!(broadcaster.subscriber_count(), 1);

        // la file du désabonné rend ses derniers messages puis None
        while stalled.recv().await.is_some() {}
        drop(stalled);
        drop(active);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_handle_unsubscribes() {
        let broadcaster = Arc::new(Broadcaster::new(8, 4));
        let handle = broadcaster.subscribe(None);
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(handle);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_draining_resets_strikes() {
        let broadcaster = Arc::new(Broadcaster::new(1, 2));
        let handle = broadcaster.subscribe(None); // file pleine: [connection]

        // un débordement, puis un drain : le compteur repart de zéro
        broadcaster.notify(&snapshot(1)); // strike 1
        assert_eq!(data_sequence(&handle.recv().await.unwrap()), 1);

        broadcaster.notify(&snapshot(2)); // livré sans débordement
        broadcaster.notify(&snapshot(3)); // strike 1 (remis à zéro avant)
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
