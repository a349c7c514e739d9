//! Job queue boundary
//!
//! The control plane never runs build/deploy work in process. It hands a
//! named job plus a flat parameter map to an external queue and only
//! observes whether the enqueue call itself was accepted. Workers run
//! out of process and report back by updating lifecycle state in the
//! store.

use async_nats::ConnectOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{Error, Result};

/// Job names understood by the workers
pub mod names {
    pub const HOST_DEPLOY: &str = "cloudmodel:host:deploy";
    pub const HOST_REDEPLOY: &str = "cloudmodel:host:redeploy";
    pub const GUEST_DEPLOY: &str = "cloudmodel:guest:deploy";
    pub const GUEST_REDEPLOY: &str = "cloudmodel:guest:redeploy";
    pub const GUEST_REDEPLOY_MANY: &str = "cloudmodel:guest:redeploy_many";
    pub const HOST_TEMPLATE_BUILD: &str = "cloudmodel:host_template:build";
}

/// Flat string parameter map passed along with a job
pub type JobParams = BTreeMap<String, String>;

/// Fire-and-forget job scheduling. Only the accept/reject of the
/// enqueue call is observable here.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &str, params: JobParams) -> Result<()>;
}

/// Envelope published for each scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: String,
    pub params: JobParams,
}

/// Configuration for the NATS-backed queue
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client name
    pub name: String,
    /// Subject prefix jobs are published under
    pub subject_prefix: String,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "cloud-model".to_string(),
            subject_prefix: "cloudmodel.jobs".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// NATS-backed [`JobQueue`]
#[derive(Clone)]
pub struct NatsJobQueue {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsJobQueue {
    /// Connect to NATS with the given configuration
    pub async fn connect(config: NatsQueueConfig) -> Result<Self> {
        let connect_options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout);

        let client = async_nats::connect_with_options(config.servers.join(","), connect_options)
            .await
            .map_err(|e| Error::Scheduling(e.to_string()))?;

        info!("Connected to NATS at {:?}", config.servers);

        Ok(Self {
            client,
            subject_prefix: config.subject_prefix,
        })
    }

    fn subject_for(&self, job: &str) -> String {
        // Job names use colons; NATS subjects use dot-separated tokens
        format!("{}.{}", self.subject_prefix, job.replace(':', "."))
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(&self, job: &str, params: JobParams) -> Result<()> {
        let envelope = JobEnvelope {
            job: job.to_string(),
            params,
        };
        let payload = serde_json::to_vec(&envelope)?;
        let subject = self.subject_for(job);

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| Error::Scheduling(e.to_string()))?;

        // Publishing is buffered; flush so enqueue acceptance is real
        self.client
            .flush()
            .await
            .map_err(|e| Error::Scheduling(e.to_string()))?;

        debug!("Enqueued job {} on subject {}", job, subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_flat_params() {
        let mut params = JobParams::new();
        params.insert("host_id".to_string(), "h-1".to_string());
        params.insert("guest_id".to_string(), "g-1".to_string());
        let envelope = JobEnvelope {
            job: names::GUEST_DEPLOY.to_string(),
            params,
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["job"], "cloudmodel:guest:deploy");
        assert_eq!(json["params"]["host_id"], "h-1");
        assert_eq!(json["params"]["guest_id"], "g-1");
    }
}
