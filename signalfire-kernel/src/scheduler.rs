/**
 * SCHEDULER - Une boucle de polling indépendante par director
 *
 * RÔLE : Interroger chaque director à son propre rythme et pousser
 * l'inventaire obtenu dans le cache.
 *
 * FONCTIONNEMENT :
 * - Une tâche tokio par cible, aucun verrou global entre cibles
 * - Dans une cible, polls strictement séquentiels (un poll lent retarde le tick suivant)
 * - Chaque fetch est borné par un timeout plus court que l'intervalle
 * - Un échec est loggé puis ignoré : le dernier snapshot reste visible dans le cache
 * - Arrêt via le signal partagé, vérifié à chaque tick et pendant le fetch
 */

use crate::cache::Cache;
use crate::director::{DirectorClient, DirectorError};
use crate::models::TargetId;
use crate::state::shutdown_requested;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Director(#[from] DirectorError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Une cible prête à être pollée
#[derive(Clone)]
pub struct Director {
    pub id: TargetId,
    pub client: Arc<dyn DirectorClient>,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
}

pub struct Scheduler {
    directors: Vec<Director>,
    cache: Arc<Cache>,
}

impl Scheduler {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { directors: Vec::new(), cache }
    }

    pub fn add_director(&mut self, director: Director) {
        self.directors.push(director);
    }

    /// Lance toutes les boucles et rend la main immédiatement
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(targets = self.directors.len(), "starting scheduler");
        self.directors
            .iter()
            .cloned()
            .map(|director| tokio::spawn(run_loop(director, self.cache.clone(), shutdown.clone())))
            .collect()
    }
}

/// Un tick : fetch borné par le timeout puis Put. Retourne le nombre de déploiements stockés.
pub async fn poll_once(director: &Director, cache: &Cache) -> Result<usize, PollError> {
    let snapshot = tokio::time::timeout(director.fetch_timeout, director.client.fetch_inventory())
        .await
        .map_err(|_| PollError::Timeout(director.fetch_timeout))??;

    let count = snapshot.deployments.len();
    cache.put(&director.id, snapshot);
    Ok(count)
}

async fn run_loop(director: Director, cache: Arc<Cache>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        director = %director.id,
        interval_secs = director.poll_interval.as_secs_f64(),
        timeout_secs = director.fetch_timeout.as_secs_f64(),
        "polling loop started"
    );

    let mut ticker = tokio::time::interval(director.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        let started = Instant::now();
        tokio::select! {
            res = poll_once(&director, &cache) => match res {
                Ok(count) => tracing::debug!(
                    director = %director.id,
                    deployments = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "poll succeeded"
                ),
                Err(e) => tracing::error!(
                    director = %director.id,
                    error = %e,
                    "poll failed, keeping last known inventory"
                ),
            },
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    tracing::info!(director = %director.id, "polling loop stopped");
}
