use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identité d'une cible (un director configuré)
pub type TargetId = String;

/// Clé de regroupement dérivée du nom d'un déploiement
pub type GroupKey = String;

/// Résultat brut d'un poll réussi sur une cible
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventorySnapshot {
    pub deployments: Vec<Deployment>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

impl InventorySnapshot {
    pub fn new(deployments: Vec<Deployment>) -> Self {
        Self { deployments, fetched_at: OffsetDateTime::now_utc() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub vms: Vec<VmHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmHealth {
    pub job: String,
    pub index: u32,
    pub id: Option<String>,      // uuid d'instance (directors récents uniquement)
    pub state: HealthState,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// État de santé d'une VM tel que rapporté par le director (`job_state`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HealthState {
    Running,
    Failing,
    Stopped,
    Unresponsive,
    Unknown(String),
}

impl HealthState {
    pub fn from_job_state(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => HealthState::Running,
            "failing" => HealthState::Failing,
            "stopped" => HealthState::Stopped,
            "unresponsive agent" | "unresponsive" => HealthState::Unresponsive,
            _ => HealthState::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HealthState::Running => "running",
            HealthState::Failing => "failing",
            HealthState::Stopped => "stopped",
            HealthState::Unresponsive => "unresponsive",
            HealthState::Unknown(raw) => raw,
        }
    }
}

impl From<String> for HealthState {
    fn from(raw: String) -> Self {
        HealthState::from_job_state(&raw)
    }
}

impl From<HealthState> for String {
    fn from(state: HealthState) -> Self {
        state.as_str().to_string()
    }
}
