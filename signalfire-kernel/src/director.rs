/**
 * DIRECTOR CLIENT - Accès à l'inventaire d'un director BOSH
 *
 * RÔLE : Frontière entre le kernel et les directors. Le scheduler ne connaît
 * que le trait DirectorClient ; BoshClient en est l'implémentation HTTP.
 *
 * FONCTIONNEMENT (API director) :
 * - GET /info : vérifie que la cible est un director et que l'auth passe
 * - GET /deployments : liste des déploiements
 * - GET /deployments/{name}/vms?format=full : lance une tâche asynchrone (302 -> /tasks/{id})
 * - GET /tasks/{id} jusqu'à state=done, puis GET /tasks/{id}/output?type=result
 *   (une VM JSON par ligne)
 */

use crate::config::TargetConfig;
use crate::models::{Deployment, HealthState, InventorySnapshot, VmHealth};
use async_trait::async_trait;
use reqwest::{redirect, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const TASK_POLL_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("director returned {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("director rejected credentials for user `{0}'")]
    Unauthorized(String),
    #[error("invalid director response: {0}")]
    InvalidResponse(String),
    #[error("director task {id} ended in state `{state}'")]
    TaskFailed { id: u64, state: String },
    #[error("invalid director URL: {0}")]
    InvalidUrl(String),
    #[error("director did not answer within {0:?}")]
    Timeout(Duration),
}

/// Interface consommée par le scheduler, une instance par cible
#[async_trait]
pub trait DirectorClient: Send + Sync {
    async fn connect(&self) -> Result<(), DirectorError>;
    async fn fetch_inventory(&self) -> Result<InventorySnapshot, DirectorError>;
}

/// Connect borné : un director qui accepte la connexion sans répondre ne bloque pas le démarrage
pub async fn connect_within(client: &dyn DirectorClient, limit: Duration) -> Result<(), DirectorError> {
    tokio::time::timeout(limit, client.connect())
        .await
        .map_err(|_| DirectorError::Timeout(limit))?
}

#[derive(Debug, Deserialize)]
struct DirectorInfo {
    name: String,
    version: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Task {
    id: u64,
    state: String,
}

#[derive(Debug, Deserialize)]
struct RawVm {
    job_name: Option<String>,
    index: Option<u32>,
    id: Option<String>,
    job_state: Option<String>,
    #[serde(default)]
    ips: Vec<String>,
}

pub struct BoshClient {
    base: Url,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl BoshClient {
    pub fn new(target: &TargetConfig) -> Result<Self, DirectorError> {
        let base = Url::parse(&target.url).map_err(|e| DirectorError::InvalidUrl(format!("{}: {e}", target.url)))?;

        // redirections gérées à la main : l'auth ne doit pas suivre un 302 vers un autre hôte
        // chaque requête est bornée, le poll complet l'est en plus par le scheduler
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(target.skip_ssl_validation)
            .connect_timeout(CONNECT_TIMEOUT.min(target.fetch_timeout()))
            .timeout(target.fetch_timeout())
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            base,
            username: target.username.clone(),
            password: target.password.clone(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DirectorError> {
        self.base
            .join(path)
            .map_err(|e| DirectorError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, DirectorError> {
        let resp = self
            .http
            .get(self.endpoint(path)?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DirectorError::Unauthorized(self.username.clone())),
            s if s.is_success() || s.is_redirection() => Ok(resp),
            status => Err(DirectorError::Status { status, path: path.to_string() }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DirectorError> {
        let resp = self.get(path).await?;
        if !resp.status().is_success() {
            return Err(DirectorError::Status { status: resp.status(), path: path.to_string() });
        }
        Ok(resp.json().await?)
    }

    async fn wait_for_task(&self, id: u64) -> Result<(), DirectorError> {
        loop {
            let task: Task = self.get_json(&format!("/tasks/{id}")).await?;
            match task.state.as_str() {
                "done" => return Ok(()),
                "queued" | "processing" | "cancelling" => tokio::time::sleep(TASK_POLL_DELAY).await,
                _ => return Err(DirectorError::TaskFailed { id: task.id, state: task.state }),
            }
        }
    }

    async fn deployment_vms(&self, deployment: &str) -> Result<Vec<VmHealth>, DirectorError> {
        let path = format!("/deployments/{deployment}/vms?format=full");
        let resp = self.get(&path).await?;

        let task_id = if resp.status().is_redirection() {
            resp.headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(task_id_from_location)
                .ok_or_else(|| DirectorError::InvalidResponse(format!("no task location for {path}")))?
        } else {
            resp.json::<Task>().await?.id
        };

        self.wait_for_task(task_id).await?;

        let output = self.get(&format!("/tasks/{task_id}/output?type=result")).await?;
        let body = output.text().await?;
        parse_vm_lines(&body)
    }
}

#[async_trait]
impl DirectorClient for BoshClient {
    async fn connect(&self) -> Result<(), DirectorError> {
        let info: DirectorInfo = self.get_json("/info").await?;

        // /info répond sans auth, `user` reste null si les identifiants sont refusés
        if info.user.is_none() {
            return Err(DirectorError::Unauthorized(self.username.clone()));
        }

        tracing::info!(
            url = %self.base,
            director = %info.name,
            version = %info.version,
            "connected to director"
        );
        Ok(())
    }

    async fn fetch_inventory(&self) -> Result<InventorySnapshot, DirectorError> {
        let refs: Vec<DeploymentRef> = self.get_json("/deployments").await?;

        let mut deployments = Vec::with_capacity(refs.len());
        for dep in refs {
            let vms = self.deployment_vms(&dep.name).await?;
            deployments.push(Deployment { name: dep.name, vms });
        }

        Ok(InventorySnapshot::new(deployments))
    }
}

/// Ex: "https://10.0.0.6:25555/tasks/1234" -> 1234
fn task_id_from_location(location: &str) -> Option<u64> {
    let path = location.split('?').next()?;
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let id = segments.next()?;
    if segments.next()? != "tasks" {
        return None;
    }
    id.parse().ok()
}

/// Sortie `result` d'une tâche vms : un objet JSON par ligne
pub fn parse_vm_lines(body: &str) -> Result<Vec<VmHealth>, DirectorError> {
    let mut vms = Vec::new();
    for (n, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawVm = serde_json::from_str(line)
            .map_err(|e| DirectorError::InvalidResponse(format!("VM record on line {}: {e}", n + 1)))?;
        vms.push(VmHealth {
            job: raw.job_name.unwrap_or_else(|| "unknown".into()),
            index: raw.index.unwrap_or(0),
            id: raw.id,
            state: raw
                .job_state
                .as_deref()
                .map(HealthState::from_job_state)
                .unwrap_or_else(|| HealthState::Unknown("unknown".into())),
            ips: raw.ips,
        });
    }
    vms.sort_by(|a, b| (a.job.as_str(), a.index).cmp(&(b.job.as_str(), b.index)));
    Ok(vms)
}
