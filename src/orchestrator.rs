//! Orchestrator
//!
//! Front door for lifecycle operations. Guards each request against the
//! entity's deployable state, marks the entity pending, and hands the
//! actual work to the external job queue. Work runs out of process;
//! only the accept/reject of the enqueue call is observed here.

use tracing::{error, info};

use crate::allocator;
use crate::config::CloudConfig;
use crate::domain::{Guest, GuestId, Host, HostId, HostTemplate, TemplateId};
use crate::errors::{Error, Result};
use crate::executor::{undefine_domain, RemoteSession, DEFAULT_STOP_TIMEOUT};
use crate::jobs::{names, JobParams, JobQueue};
use crate::state_machine::LifecycleState;
use crate::store::Store;

/// Issue text recorded when the queue refuses an enqueue call
pub const ENQUEUE_FAILURE_ISSUE: &str = "Unable to enqueue job! Try again later.";

/// Drives entity lifecycles against a store and a job queue
pub struct Orchestrator<S, Q> {
    store: S,
    queue: Q,
    config: CloudConfig,
}

impl<S: Store, Q: JobQueue> Orchestrator<S, Q> {
    pub fn new(store: S, queue: Q, config: CloudConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Schedule a host deploy. Returns `Ok(false)` without side effects
    /// when the host has an operation in flight and `force` is not set.
    pub async fn deploy_host(&self, id: HostId, force: bool) -> Result<bool> {
        self.request_host_deploy(id, names::HOST_DEPLOY, force).await
    }

    /// Schedule a host redeploy over an existing installation
    pub async fn redeploy_host(&self, id: HostId, force: bool) -> Result<bool> {
        self.request_host_deploy(id, names::HOST_REDEPLOY, force).await
    }

    async fn request_host_deploy(&self, id: HostId, job: &str, force: bool) -> Result<bool> {
        let host = self
            .store
            .host(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("host {id}")))?;

        if !host.deployable() && !force {
            return Ok(false);
        }

        self.store
            .set_host_deploy_state(id, LifecycleState::Pending, None)
            .await?;

        let mut params = JobParams::new();
        params.insert("host_id".to_string(), id.to_string());

        if let Err(e) = self.queue.enqueue(job, params).await {
            error!("Failed to enqueue {} for host {}: {}", job, host.name, e);
            self.store
                .set_host_deploy_state(
                    id,
                    LifecycleState::Failed,
                    Some(ENQUEUE_FAILURE_ISSUE.to_string()),
                )
                .await?;
            return Ok(true);
        }

        info!("Scheduled {} for host {}", job, host.name);
        Ok(true)
    }

    /// Schedule a guest deploy. Returns `Ok(false)` without side effects
    /// when the guest has an operation in flight and `force` is not set.
    pub async fn deploy_guest(&self, id: GuestId, force: bool) -> Result<bool> {
        self.request_guest_deploy(id, names::GUEST_DEPLOY, force).await
    }

    /// Schedule a guest redeploy over an existing instance
    pub async fn redeploy_guest(&self, id: GuestId, force: bool) -> Result<bool> {
        self.request_guest_deploy(id, names::GUEST_REDEPLOY, force).await
    }

    async fn request_guest_deploy(&self, id: GuestId, job: &str, force: bool) -> Result<bool> {
        let guest = self
            .store
            .guest(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))?;

        if !guest.deployable() && !force {
            return Ok(false);
        }

        self.store
            .set_guest_deploy_state(id, LifecycleState::Pending, None)
            .await?;

        let mut params = JobParams::new();
        params.insert("host_id".to_string(), guest.host_id.to_string());
        params.insert("guest_id".to_string(), id.to_string());

        if let Err(e) = self.queue.enqueue(job, params).await {
            error!("Failed to enqueue {} for guest {}: {}", job, guest.name, e);
            self.store
                .set_guest_deploy_state(
                    id,
                    LifecycleState::Failed,
                    Some(ENQUEUE_FAILURE_ISSUE.to_string()),
                )
                .await?;
            return Ok(true);
        }

        info!("Scheduled {} for guest {}", job, guest.name);
        Ok(true)
    }

    /// Schedule a redeploy over a batch of guests. Ids that do not exist
    /// are dropped; the remaining guests move to pending in one write
    /// and one job covers the whole batch. An empty unforced batch is a
    /// no-op returning `Ok(false)`.
    pub async fn redeploy_guests(&self, ids: &[GuestId], force: bool) -> Result<bool> {
        let existing = self.store.existing_guest_ids(ids).await?;

        if existing.is_empty() && !force {
            return Ok(false);
        }

        self.store
            .set_guests_deploy_state(&existing, LifecycleState::Pending, None)
            .await?;

        let guest_ids = existing
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let mut params = JobParams::new();
        params.insert("guest_ids".to_string(), guest_ids);

        if let Err(e) = self.queue.enqueue(names::GUEST_REDEPLOY_MANY, params).await {
            error!("Failed to enqueue batch guest redeploy: {}", e);
            self.store
                .set_guests_deploy_state(
                    &existing,
                    LifecycleState::Failed,
                    Some(ENQUEUE_FAILURE_ISSUE.to_string()),
                )
                .await?;
            return Ok(true);
        }

        info!("Scheduled batch redeploy of {} guests", existing.len());
        Ok(true)
    }

    /// Schedule a template build on the given host. Returns `Ok(false)`
    /// when a build is in flight and `force` is not set.
    pub async fn build_template(
        &self,
        template_id: TemplateId,
        host_id: HostId,
        force: bool,
    ) -> Result<bool> {
        let template = self
            .store
            .template(template_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {template_id}")))?;

        if !template.buildable() && !force {
            return Ok(false);
        }

        self.store
            .set_template_build_state(template_id, LifecycleState::Pending, None)
            .await?;

        let mut params = JobParams::new();
        params.insert("host_id".to_string(), host_id.to_string());
        params.insert("template_id".to_string(), template_id.to_string());

        if let Err(e) = self.queue.enqueue(names::HOST_TEMPLATE_BUILD, params).await {
            error!("Failed to enqueue template build {}: {}", template_id, e);
            self.store
                .set_template_build_state(
                    template_id,
                    LifecycleState::Failed,
                    Some(ENQUEUE_FAILURE_ISSUE.to_string()),
                )
                .await?;
            return Ok(true);
        }

        info!("Scheduled build of template {}", template_id);
        Ok(true)
    }

    /// Latest finished template for the architecture; when none exists,
    /// create one and schedule its build on `build_host`. The caller
    /// gets the fresh template back in pending state and must wait for
    /// the build to finish before using it.
    pub async fn usable_template(
        &self,
        arch: &str,
        build_host: HostId,
    ) -> Result<HostTemplate> {
        if let Some(template) = self.store.finished_template_for(arch).await? {
            return Ok(template);
        }

        let template = HostTemplate::new(arch);
        let id = template.id;
        self.store.insert_template(template).await?;
        self.build_template(id, build_host, false).await?;

        self.store
            .template(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {id}")))
    }

    /// Persist a new host, generating its MAC prefix when unset
    pub async fn create_host(&self, mut host: Host) -> Result<Host> {
        if host.mac_address_prefix.is_none() {
            let hosts = self.store.hosts().await?;
            host.mac_address_prefix = Some(allocator::generate_mac_prefix(
                self.config.host_mac_address_prefix_init,
                &hosts,
                None,
            )?);
        }

        host.validate()?;
        self.store.insert_host(host.clone()).await?;
        info!("Created host {}", host.name);
        Ok(host)
    }

    /// Persist a new guest, allocating its private address and MAC when
    /// unset. Allocation reads are not transactional; a `Conflict` on
    /// insert means another writer won the value and allocation should
    /// be retried.
    pub async fn create_guest(&self, mut guest: Guest) -> Result<Guest> {
        let host = self
            .store
            .host(guest.host_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("host {}", guest.host_id)))?;
        let siblings = self.store.guests_of(host.id).await?;

        if guest.private_address.is_none() {
            guest.private_address =
                Some(allocator::next_private_address(&host, &siblings).ok_or_else(|| {
                    Error::AllocationExhausted(format!(
                        "no free private address on host {}",
                        host.name
                    ))
                })?);
        }

        if guest.mac_address.is_none() {
            guest.mac_address = Some(allocator::generate_mac_address(
                &host,
                &siblings,
                Some(guest.id),
            )?);
        }

        guest.validate()?;
        self.store.insert_guest(guest.clone()).await?;
        info!("Created guest {} on host {}", guest.name, host.name);
        Ok(guest)
    }

    /// Tear a guest down and delete its record. Safe to call for guests
    /// whose domain was never defined on the host.
    pub async fn destroy_guest(
        &self,
        id: GuestId,
        session: &mut dyn RemoteSession,
    ) -> Result<()> {
        let guest = self
            .store
            .guest(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))?;

        if !undefine_domain(session, &guest.name, DEFAULT_STOP_TIMEOUT).await? {
            return Err(Error::Remote {
                message: format!("Failed to undefine domain {}", guest.name),
                output: String::new(),
            });
        }

        self.store.delete_guest(id).await?;
        info!("Destroyed guest {}", guest.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;
    use crate::executor::testing::ScriptedSession;
    use crate::executor::ExecOutcome;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Records enqueued jobs; optionally refuses every call
    struct RecordingQueue {
        jobs: Mutex<Vec<(String, JobParams)>>,
        refuse: bool,
    }

    impl RecordingQueue {
        fn new() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                refuse: false,
            }
        }

        fn refusing() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                refuse: true,
            }
        }

        fn recorded(&self) -> Vec<(String, JobParams)> {
            self.jobs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(&self, job: &str, params: JobParams) -> Result<()> {
            if self.refuse {
                return Err(Error::Scheduling("queue unavailable".to_string()));
            }
            self.jobs.lock().unwrap().push((job.to_string(), params));
            Ok(())
        }
    }

    fn host() -> Host {
        let mut host = Host::new(
            "h1",
            Address::new("198.51.100.10").unwrap(),
            Address::new("10.42.0.0/24").unwrap(),
        )
        .unwrap();
        host.mac_address_prefix = Some(crate::domain::MacPrefix::from_value(1));
        host
    }

    async fn orchestrator_with_host(
        queue: RecordingQueue,
    ) -> (Orchestrator<MemoryStore, RecordingQueue>, Host) {
        let store = MemoryStore::new();
        let host = host();
        store.insert_host(host.clone()).await.unwrap();
        (
            Orchestrator::new(store, queue, CloudConfig::default()),
            host,
        )
    }

    #[tokio::test]
    async fn deploy_host_enqueues_and_marks_pending() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;

        assert!(orchestrator.deploy_host(host.id, false).await.unwrap());

        let stored = orchestrator.store().host(host.id).await.unwrap().unwrap();
        assert_eq!(stored.deploy_state, LifecycleState::Pending);

        let jobs = orchestrator.queue.recorded();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, names::HOST_DEPLOY);
        assert_eq!(jobs[0].1["host_id"], host.id.to_string());
    }

    #[tokio::test]
    async fn deploy_refused_while_operation_in_flight() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;
        orchestrator
            .store()
            .set_host_deploy_state(host.id, LifecycleState::Running, None)
            .await
            .unwrap();

        assert!(!orchestrator.deploy_host(host.id, false).await.unwrap());
        assert!(orchestrator.queue.recorded().is_empty());

        // Force bypasses the guard
        assert!(orchestrator.deploy_host(host.id, true).await.unwrap());
        assert_eq!(orchestrator.queue.recorded().len(), 1);
    }

    #[tokio::test]
    async fn scheduling_failure_marks_failed_with_issue() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::refusing()).await;

        // The scheduling error is absorbed, not propagated
        assert!(orchestrator.redeploy_host(host.id, false).await.unwrap());

        let stored = orchestrator.store().host(host.id).await.unwrap().unwrap();
        assert_eq!(stored.deploy_state, LifecycleState::Failed);
        assert_eq!(
            stored.deploy_last_issue.as_deref(),
            Some("Unable to enqueue job! Try again later.")
        );
    }

    #[tokio::test]
    async fn guest_deploy_params_name_host_and_guest() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;
        let mut guest = Guest::new(host.id, "g1").unwrap();
        guest.private_address = Some("10.42.0.23".parse().unwrap());
        guest.mac_address = Some("00:16:3e:00:01:01".parse().unwrap());
        orchestrator.store().insert_guest(guest.clone()).await.unwrap();

        assert!(orchestrator.deploy_guest(guest.id, false).await.unwrap());

        let jobs = orchestrator.queue.recorded();
        assert_eq!(jobs[0].0, names::GUEST_DEPLOY);
        assert_eq!(jobs[0].1["host_id"], host.id.to_string());
        assert_eq!(jobs[0].1["guest_id"], guest.id.to_string());
    }

    #[tokio::test]
    async fn batch_redeploy_skips_missing_ids() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;

        let mut ids = Vec::new();
        for (name, last_octet) in [("g1", 21), ("g3", 23)] {
            let mut guest = Guest::new(host.id, name).unwrap();
            guest.private_address = Some(format!("10.42.0.{last_octet}").parse().unwrap());
            guest.mac_address =
                Some(format!("00:16:3e:00:01:{last_octet:02X}").parse().unwrap());
            orchestrator.store().insert_guest(guest.clone()).await.unwrap();
            ids.push(guest.id);
        }
        let missing = GuestId::new();
        let batch = vec![missing, ids[0], ids[1]];

        assert!(orchestrator.redeploy_guests(&batch, false).await.unwrap());

        for id in &ids {
            let stored = orchestrator.store().guest(*id).await.unwrap().unwrap();
            assert_eq!(stored.deploy_state, LifecycleState::Pending);
        }

        let jobs = orchestrator.queue.recorded();
        assert_eq!(jobs[0].0, names::GUEST_REDEPLOY_MANY);
        assert_eq!(
            jobs[0].1["guest_ids"],
            format!("{} {}", ids[0], ids[1])
        );
    }

    #[tokio::test]
    async fn empty_unforced_batch_is_a_noop() {
        let (orchestrator, _) = orchestrator_with_host(RecordingQueue::new()).await;
        let batch = vec![GuestId::new()];
        assert!(!orchestrator.redeploy_guests(&batch, false).await.unwrap());
        assert!(orchestrator.queue.recorded().is_empty());
    }

    #[tokio::test]
    async fn batch_scheduling_failure_marks_all_failed() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::refusing()).await;
        let mut guest = Guest::new(host.id, "g1").unwrap();
        guest.private_address = Some("10.42.0.21".parse().unwrap());
        guest.mac_address = Some("00:16:3e:00:01:01".parse().unwrap());
        orchestrator.store().insert_guest(guest.clone()).await.unwrap();

        assert!(orchestrator
            .redeploy_guests(&[guest.id], false)
            .await
            .unwrap());

        let stored = orchestrator.store().guest(guest.id).await.unwrap().unwrap();
        assert_eq!(stored.deploy_state, LifecycleState::Failed);
        assert_eq!(stored.deploy_last_issue.as_deref(), Some(ENQUEUE_FAILURE_ISSUE));
    }

    #[tokio::test]
    async fn usable_template_prefers_finished() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;
        let template = HostTemplate::new("amd64");
        orchestrator
            .store()
            .insert_template(template.clone())
            .await
            .unwrap();
        orchestrator
            .store()
            .set_template_build_state(template.id, LifecycleState::Finished, None)
            .await
            .unwrap();

        let found = orchestrator.usable_template("amd64", host.id).await.unwrap();
        assert_eq!(found.id, template.id);
        assert!(orchestrator.queue.recorded().is_empty());
    }

    #[tokio::test]
    async fn usable_template_builds_when_none_finished() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;

        let template = orchestrator.usable_template("arm64", host.id).await.unwrap();
        assert_eq!(template.arch, "arm64");
        assert_eq!(template.build_state, LifecycleState::Pending);

        let jobs = orchestrator.queue.recorded();
        assert_eq!(jobs[0].0, names::HOST_TEMPLATE_BUILD);
        assert_eq!(jobs[0].1["template_id"], template.id.to_string());
        assert_eq!(jobs[0].1["host_id"], host.id.to_string());
    }

    #[tokio::test]
    async fn create_guest_allocates_network_identity() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;

        let guest = orchestrator
            .create_guest(Guest::new(host.id, "g1").unwrap())
            .await
            .unwrap();

        // Highest free address in 10.42.0.0/24 and first counter value
        assert_eq!(guest.private_address, Some("10.42.0.254".parse().unwrap()));
        assert_eq!(
            guest.mac_address.unwrap().to_string(),
            "00:16:3e:00:01:01"
        );
        assert!(orchestrator.store().guest(guest.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_host_generates_mac_prefix() {
        let store = MemoryStore::new();
        let existing = host();
        store.insert_host(existing).await.unwrap();
        let orchestrator =
            Orchestrator::new(store, RecordingQueue::new(), CloudConfig::default());

        let new_host = Host::new(
            "h2",
            Address::new("198.51.100.11").unwrap(),
            Address::new("10.43.0.0/24").unwrap(),
        )
        .unwrap();
        let created = orchestrator.create_host(new_host).await.unwrap();

        // Prefix 1 is taken by the existing host
        assert_eq!(created.mac_address_prefix.unwrap().value(), 0);
    }

    #[tokio::test]
    async fn destroy_guest_is_idempotent_on_remote_state() {
        let (orchestrator, host) = orchestrator_with_host(RecordingQueue::new()).await;
        let mut guest = Guest::new(host.id, "g1").unwrap();
        guest.private_address = Some("10.42.0.21".parse().unwrap());
        guest.mac_address = Some("00:16:3e:00:01:01".parse().unwrap());
        orchestrator.store().insert_guest(guest.clone()).await.unwrap();

        // Domain was never defined on the host
        let mut session = ScriptedSession::new(vec![ExecOutcome::failed(
            "error: failed to get domain 'g1'",
        )]);
        orchestrator.destroy_guest(guest.id, &mut session).await.unwrap();

        assert!(orchestrator.store().guest(guest.id).await.unwrap().is_none());
        assert_eq!(session.commands, vec!["virsh domstate g1"]);
    }
}
