/**
 * COLLATOR - Regroupement des déploiements par règles regex ordonnées
 *
 * RÔLE : Dériver une vue agrégée (clé de groupe -> déploiements membres)
 * à partir du contenu complet du cache, et la garder à jour.
 *
 * FONCTIONNEMENT :
 * - Règles évaluées dans l'ordre configuré, la première qui matche gagne
 * - Clé = groupe de capture de la règle (ou match complet sans groupe)
 * - Aucun match => bucket réservé UNGROUPED_KEY
 * - A chaque notification du cache : recalcul complet, puis remplacement
 *   atomique de la vue exposée (jamais de mise à jour incrémentale)
 */

use crate::cache::Cache;
use crate::models::{Deployment, GroupKey, HealthState, TargetId, VmHealth};
use crate::state::{new_state, shutdown_requested, Shared};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Clé réservée des déploiements qu'aucune règle ne reconnaît.
/// Les noms de déploiement BOSH n'acceptent pas les parenthèses, pas de collision possible.
pub const UNGROUPED_KEY: &str = "(ungrouped)";

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid pattern `{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("pattern `{pattern}' has {groups} capture group(s), capture index {index} is out of range")]
    CaptureOutOfRange {
        pattern: String,
        groups: usize,
        index: usize,
    },
}

/// Règle de classification : un pattern + l'index du groupe qui donne la clé
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pattern: Regex,
    capture: usize,
}

impl ClassificationRule {
    /// Sans index explicite : groupe 1 si le pattern en définit un, sinon le match complet
    pub fn new(pattern: &str, capture: Option<usize>) -> Result<Self, RuleError> {
        let regex = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        // captures_len() compte aussi le groupe 0 (match complet)
        let groups = regex.captures_len() - 1;
        let capture = match capture {
            Some(index) if index > groups => {
                return Err(RuleError::CaptureOutOfRange {
                    pattern: pattern.to_string(),
                    groups,
                    index,
                })
            }
            Some(index) => index,
            None if groups > 0 => 1,
            None => 0,
        };

        Ok(Self { pattern: regex, capture })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn capture(&self) -> usize {
        self.capture
    }

    /// Clé de groupe pour ce nom, ou None si la règle ne s'applique pas.
    /// Un groupe qui ne participe pas au match compte comme un non-match.
    pub fn group_key(&self, name: &str) -> Option<GroupKey> {
        let caps = self.pattern.captures(name)?;
        caps.get(self.capture).map(|m| m.as_str().to_string())
    }
}

/// First-match-wins sur la liste ordonnée
pub fn classify(rules: &[ClassificationRule], name: &str) -> GroupKey {
    rules
        .iter()
        .find_map(|rule| rule.group_key(name))
        .unwrap_or_else(|| UNGROUPED_KEY.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub running: usize,
    pub failing: usize,
    pub stopped: usize,
    pub unresponsive: usize,
    pub unknown: usize,
}

impl HealthSummary {
    pub fn of(vms: &[VmHealth]) -> Self {
        let mut summary = Self::default();
        for vm in vms {
            summary.record(&vm.state);
        }
        summary
    }

    pub fn record(&mut self, state: &HealthState) {
        self.total += 1;
        match state {
            HealthState::Running => self.running += 1,
            HealthState::Failing => self.failing += 1,
            HealthState::Stopped => self.stopped += 1,
            HealthState::Unresponsive => self.unresponsive += 1,
            HealthState::Unknown(_) => self.unknown += 1,
        }
    }

    pub fn merge(&mut self, other: &HealthSummary) {
        self.total += other.total;
        self.running += other.running;
        self.failing += other.failing;
        self.stopped += other.stopped;
        self.unresponsive += other.unresponsive;
        self.unknown += other.unknown;
    }

    pub fn is_healthy(&self) -> bool {
        self.running == self.total
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub target: TargetId,
    pub deployment: Deployment,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub key: GroupKey,
    pub members: Vec<GroupMember>,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollatedView {
    pub groups: BTreeMap<GroupKey, Group>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl CollatedView {
    pub fn empty() -> Self {
        Self { groups: BTreeMap::new(), generated_at: OffsetDateTime::now_utc() }
    }

    pub fn deployment_count(&self) -> usize {
        self.groups.values().map(|g| g.members.len()).sum()
    }
}

pub struct Collator {
    rules: Shared<Vec<ClassificationRule>>,
    view: Shared<Arc<CollatedView>>,
    // un seul recalcul à la fois : lecture du cache et publication dans le même ordre
    recompute_guard: Mutex<()>,
}

impl Collator {
    pub fn new() -> Self {
        Self {
            rules: new_state(Vec::new()),
            view: new_state(Arc::new(CollatedView::empty())),
            recompute_guard: Mutex::new(()),
        }
    }

    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        let collator = Self::new();
        for rule in rules {
            collator.add_rule(rule);
        }
        collator
    }

    /// Ajoute une règle en fin de liste (priorité la plus basse)
    pub fn add_rule(&self, rule: ClassificationRule) {
        tracing::debug!(pattern = rule.pattern(), capture = rule.capture(), "collation rule added");
        self.rules.write().push(rule);
    }

    pub fn rule_patterns(&self) -> Vec<String> {
        self.rules.read().iter().map(|r| r.pattern().to_string()).collect()
    }

    /// Reconstruit la vue à partir du contenu complet du cache et la publie.
    /// Les appels concurrents sont sérialisés : une vue publiée n'est jamais
    /// remplacée par une vue calculée sur un cache plus ancien.
    pub fn recompute(&self, cache: &Cache) -> Arc<CollatedView> {
        let _guard = self.recompute_guard.lock();
        let entries = cache.snapshot();
        let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();

        {
            // verrou lecture tenu pendant tout le calcul : add_rule attend la fin
            let rules = self.rules.read();
            for entry in entries.values() {
                for deployment in &entry.snapshot.deployments {
                    let key = classify(&rules, &deployment.name);
                    let health = HealthSummary::of(&deployment.vms);
                    let group = groups.entry(key.clone()).or_insert_with(|| Group {
                        key,
                        members: Vec::new(),
                        health: HealthSummary::default(),
                    });
                    group.health.merge(&health);
                    group.members.push(GroupMember {
                        target: entry.target.clone(),
                        deployment: deployment.clone(),
                        health,
                    });
                }
            }
        }

        for group in groups.values_mut() {
            group.members.sort_by(|a, b| {
                (a.target.as_str(), a.deployment.name.as_str())
                    .cmp(&(b.target.as_str(), b.deployment.name.as_str()))
            });
        }

        let view = Arc::new(CollatedView { groups, generated_at: OffsetDateTime::now_utc() });
        *self.view.write() = view.clone();

        tracing::debug!(
            targets = entries.len(),
            groups = view.groups.len(),
            deployments = view.deployment_count(),
            "collated view recomputed"
        );
        view
    }

    /// Dernière vue complète ; ne bloque jamais sur un recalcul en cours
    pub fn snapshot(&self) -> Arc<CollatedView> {
        self.view.read().clone()
    }

    pub fn group(&self, key: &str) -> Option<Group> {
        self.view.read().groups.get(key).cloned()
    }

    /// S'abonne au cache et recalcule la vue en tâche de fond à chaque changement
    pub fn watch_async(
        self: &Arc<Self>,
        cache: Arc<Cache>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        // abonnement synchrone : tout Put postérieur à cet appel déclenche un recalcul
        let mut subscription = cache.subscribe();
        let collator = Arc::clone(self);

        tokio::spawn(async move {
            let rule_count = collator.rules.read().len();
            tracing::info!(rules = rule_count, subscriber = subscription.id(), "collator watching cache");
            collator.recompute(&cache);

            loop {
                tokio::select! {
                    changed = subscription.changed() => {
                        if !changed {
                            break;
                        }
                        collator.recompute(&cache);
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }

            tracing::info!("collator stopped");
        })
    }
}

impl Default for Collator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InventorySnapshot;
    use std::time::Duration;

    fn rules(patterns: &[&str]) -> Vec<ClassificationRule> {
        patterns.iter().map(|p| ClassificationRule::new(p, None).unwrap()).collect()
    }

    fn deployment(name: &str, states: &[HealthState]) -> Deployment {
        Deployment {
            name: name.to_string(),
            vms: states
                .iter()
                .enumerate()
                .map(|(i, s)| VmHealth {
                    job: "worker".into(),
                    index: i as u32,
                    id: None,
                    state: s.clone(),
                    ips: vec![],
                })
                .collect(),
        }
    }

    fn inventory(names: &[&str]) -> InventorySnapshot {
        InventorySnapshot::new(names.iter().map(|n| deployment(n, &[HealthState::Running])).collect())
    }

    #[test]
    fn test_first_match_wins() {
        let rules = rules(&[".*-(.*)", "(.*)"]);
        assert_eq!(classify(&rules, "myapp-prod"), "prod");
        assert_eq!(classify(&rules, "standalone"), "standalone");
    }

    #[test]
    fn test_rule_order_changes_outcome() {
        let rules = rules(&["(.*)", ".*-(.*)"]);
        assert_eq!(classify(&rules, "myapp-prod"), "myapp-prod");
    }

    #[test]
    fn test_classification_is_deterministic() {
        let rules = rules(&[".*-(.*)", "(.*)"]);
        let first = classify(&rules, "cf-redis-staging");
        for _ in 0..100 {
            assert_eq!(classify(&rules, "cf-redis-staging"), first);
        }
        assert_eq!(first, "staging");
    }

    #[test]
    fn test_no_capture_group_uses_full_match() {
        let rule = ClassificationRule::new("prod", None).unwrap();
        assert_eq!(rule.capture(), 0);
        assert_eq!(rule.group_key("cf-prod-east").as_deref(), Some("prod"));
    }

    #[test]
    fn test_explicit_capture_index() {
        let rule = ClassificationRule::new(r"^(\w+)-(\w+)$", Some(1)).unwrap();
        assert_eq!(rule.group_key("cf-prod").as_deref(), Some("cf"));

        let rule = ClassificationRule::new(r"^(\w+)-(\w+)$", Some(2)).unwrap();
        assert_eq!(rule.group_key("cf-prod").as_deref(), Some("prod"));
    }

    #[test]
    fn test_no_match_is_ungrouped() {
        let rules = rules(&["^cf-(.*)"]);
        assert_eq!(classify(&rules, "redis"), UNGROUPED_KEY);
        assert_eq!(classify(&[], "redis"), UNGROUPED_KEY);
    }

    #[test]
    fn test_non_participating_group_falls_through() {
        let rules = vec![
            ClassificationRule::new("^(?:a-(x)|b-y)$", Some(1)).unwrap(),
            ClassificationRule::new("(.*)", None).unwrap(),
        ];
        assert_eq!(classify(&rules, "a-x"), "x");
        assert_eq!(classify(&rules, "b-y"), "b-y");
    }

    #[test]
    fn test_invalid_rules_rejected_at_load() {
        assert!(matches!(
            ClassificationRule::new("(unclosed", None),
            Err(RuleError::InvalidPattern { .. })
        ));
        assert!(matches!(
            ClassificationRule::new("(a)", Some(2)),
            Err(RuleError::CaptureOutOfRange { groups: 1, index: 2, .. })
        ));
    }

    #[test]
    fn test_add_rule_appends_in_order() {
        let collator = Collator::new();
        collator.add_rule(ClassificationRule::new(".*-(.*)", None).unwrap());
        collator.add_rule(ClassificationRule::new("(.*)", None).unwrap());

        assert_eq!(collator.rule_patterns(), vec![".*-(.*)", "(.*)"]);
        assert_eq!(classify(&collator.rules.read(), "myapp-prod"), "prod");
    }

    #[test]
    fn test_recompute_unions_all_targets() {
        let cache = Cache::new();
        cache.put("bosh-a", inventory(&["cf-prod", "redis-prod"]));
        cache.put("bosh-b", inventory(&["cf-staging", "standalone"]));
        cache.put("bosh-c", inventory(&["mysql-prod"]));

        let collator = Collator::with_rules(rules(&[".*-(.*)", "(.*)"]));
        let view = collator.recompute(&cache);

        assert_eq!(view.deployment_count(), 5);
        assert_eq!(view.groups.keys().cloned().collect::<Vec<_>>(), vec!["prod", "staging", "standalone"]);

        let prod = &view.groups["prod"];
        let members: Vec<(&str, &str)> = prod
            .members
            .iter()
            .map(|m| (m.target.as_str(), m.deployment.name.as_str()))
            .collect();
        assert_eq!(members, vec![("bosh-a", "cf-prod"), ("bosh-a", "redis-prod"), ("bosh-c", "mysql-prod")]);
        assert_eq!(view.groups["standalone"].members[0].target, "bosh-b");
    }

    #[test]
    fn test_health_carried_through_and_summarised() {
        let cache = Cache::new();
        cache.put(
            "bosh-a",
            InventorySnapshot::new(vec![
                deployment("cf-prod", &[HealthState::Running, HealthState::Failing]),
                deployment("redis-prod", &[HealthState::Unresponsive]),
            ]),
        );

        let collator = Collator::with_rules(rules(&[".*-(.*)"]));
        let view = collator.recompute(&cache);
        let prod = &view.groups["prod"];

        assert_eq!(prod.health.total, 3);
        assert_eq!(prod.health.running, 1);
        assert_eq!(prod.health.failing, 1);
        assert_eq!(prod.health.unresponsive, 1);
        assert!(!prod.health.is_healthy());
        assert_eq!(prod.members[0].deployment.vms[1].state, HealthState::Failing);
    }

    #[test]
    fn test_decommissioned_deployment_disappears() {
        let cache = Cache::new();
        let collator = Collator::with_rules(rules(&[".*-(.*)", "(.*)"]));

        cache.put("bosh-a", inventory(&["cf-prod", "legacy-old"]));
        let before = collator.recompute(&cache);
        assert!(before.groups.contains_key("old"));

        cache.put("bosh-a", inventory(&["cf-prod"]));
        let after = collator.recompute(&cache);
        assert!(!after.groups.contains_key("old"));
        assert_eq!(after.deployment_count(), 1);
    }

    #[test]
    fn test_concurrent_recomputes_never_publish_older_view() {
        let cache = Arc::new(Cache::new());
        let collator = Arc::new(Collator::with_rules(rules(&[".*-(.*)"])));

        let writer = {
            let (cache, collator) = (cache.clone(), collator.clone());
            std::thread::spawn(move || {
                for i in 0..200 {
                    let name = format!("app{i}-prod");
                    cache.put("bosh-a", inventory(&[name.as_str()]));
                }
                collator.recompute(&cache);
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let (cache, collator) = (cache.clone(), collator.clone());
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        collator.recompute(&cache);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        let prod = collator.group("prod").unwrap();
        assert_eq!(prod.members.len(), 1);
        assert_eq!(prod.members[0].deployment.name, "app199-prod");
    }

    #[tokio::test]
    async fn test_watch_async_tracks_cache_changes() {
        let cache = Arc::new(Cache::new());
        let collator = Arc::new(Collator::with_rules(rules(&[".*-(.*)", "(.*)"])));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = collator.watch_async(cache.clone(), shutdown_rx);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("app{i}-prod");
                cache.put(&format!("bosh-{i}"), inventory(&[name.as_str()]));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut settled = false;
        for _ in 0..100 {
            if collator.snapshot().deployment_count() == 8 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled, "collated view never reflected all puts");
        assert_eq!(collator.group("prod").unwrap().members.len(), 8);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watch_async_picks_up_existing_entries() {
        let cache = Arc::new(Cache::new());
        cache.put("bosh-a", inventory(&["cf-prod"]));

        let collator = Arc::new(Collator::with_rules(rules(&[".*-(.*)"])));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _handle = collator.watch_async(cache.clone(), shutdown_rx);

        for _ in 0..100 {
            if collator.group("prod").is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("initial recompute never happened");
    }
}
