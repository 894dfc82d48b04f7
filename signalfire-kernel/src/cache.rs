/**
 * CACHE - Dernier inventaire connu par cible, partagé entre toutes les tâches
 *
 * RÔLE : Seul état mutable partagé du kernel. Les boucles de polling y écrivent,
 * le collator et l'API REST y lisent.
 *
 * FONCTIONNEMENT :
 * - Une entrée par cible, remplacée en bloc (Arc) à chaque poll réussi
 * - Les lecteurs clonent l'Arc : jamais d'entrée à moitié écrite
 * - Chaque Put notifie les abonnés via un canal borné à 1 (try_send) :
 *   un abonné lent ne bloque jamais l'écrivain, les notifications se coalescent
 */

use crate::models::{InventorySnapshot, TargetId};
use crate::state::{new_state, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Jamais sérialisée telle quelle : l'API passe par ses propres vues
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub target: TargetId,
    pub snapshot: Arc<InventorySnapshot>,
    pub updated_at: OffsetDateTime,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<()>,
}

/// Abonnement aux changements du cache
/// Le drop ou `unsubscribe` arrête la livraison des notifications
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attend le prochain changement. Retourne false si le cache a disparu.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Ferme le canal : l'abonné disparaît du compte tout de suite, de la liste au prochain Put
    pub fn unsubscribe(mut self) {
        self.rx.close();
        tracing::debug!(subscriber = self.id, "cache subscriber unregistered");
    }
}

pub struct Cache {
    entries: Shared<HashMap<TargetId, Arc<CacheEntry>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: new_state(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Stocke (ou remplace) le snapshot d'une cible puis notifie chaque abonné une fois
    pub fn put(&self, target: &str, snapshot: InventorySnapshot) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            target: target.to_string(),
            snapshot: Arc::new(snapshot),
            updated_at: OffsetDateTime::now_utc(),
        });

        self.entries.write().insert(target.to_string(), entry.clone());
        self.notify();
        entry
    }

    pub fn get(&self, target: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(target).cloned()
    }

    /// Copie cohérente de toutes les entrées à un instant donné
    pub fn snapshot(&self) -> HashMap<TargetId, Arc<CacheEntry>> {
        self.entries.read().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        // capacité 1 : au plus une notification en attente par abonné
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(Subscriber { id, tx });
        tracing::debug!(subscriber = id, "cache subscriber registered");
        Subscription { id, rx }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.entries.read().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|s| !s.tx.is_closed()).count()
    }

    fn notify(&self) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(()) {
            Ok(()) => true,
            // une notification est déjà en attente : coalescée
            Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => {
                tracing::debug!(subscriber = sub.id, "cache subscriber gone, pruning");
                false
            }
        });
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
