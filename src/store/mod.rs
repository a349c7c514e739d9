//! Document store boundary
//!
//! The store is the single source of truth for lifecycle state and
//! address/MAC assignment. It enforces the uniqueness invariants at
//! write time; allocation reads are not transactional, so writers must
//! treat a [`Conflict`](crate::errors::Error::Conflict) as a retryable
//! condition.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::net::IpAddr;

use crate::domain::{
    Address, AddressResolution, Guest, GuestId, Host, HostId, HostTemplate, TemplateId,
};
use crate::errors::Result;
use crate::state_machine::LifecycleState;

/// Persistence operations the control plane needs.
///
/// State setters overwrite the issue text only when one is given;
/// passing `None` leaves the recorded issue untouched, matching how a
/// pending transition keeps the previous run's diagnostics around.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hosts(&self) -> Result<Vec<Host>>;
    async fn host(&self, id: HostId) -> Result<Option<Host>>;
    /// Insert with uniqueness checks on name and MAC prefix
    async fn insert_host(&self, host: Host) -> Result<()>;
    async fn update_host(&self, host: Host) -> Result<()>;
    async fn set_host_deploy_state(
        &self,
        id: HostId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()>;
    async fn set_host_build_state(
        &self,
        id: HostId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()>;

    async fn guest(&self, id: GuestId) -> Result<Option<Guest>>;
    async fn guests_of(&self, host_id: HostId) -> Result<Vec<Guest>>;
    /// Insert with per-host uniqueness checks on name, private address,
    /// and MAC address
    async fn insert_guest(&self, guest: Guest) -> Result<()>;
    async fn update_guest(&self, guest: Guest) -> Result<()>;
    async fn delete_guest(&self, id: GuestId) -> Result<()>;
    async fn set_guest_deploy_state(
        &self,
        id: GuestId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()>;
    /// Set many guests' deploy state as a single write
    async fn set_guests_deploy_state(
        &self,
        ids: &[GuestId],
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()>;
    /// Filter the given ids down to those that exist
    async fn existing_guest_ids(&self, ids: &[GuestId]) -> Result<Vec<GuestId>>;

    async fn template(&self, id: TemplateId) -> Result<Option<HostTemplate>>;
    async fn insert_template(&self, template: HostTemplate) -> Result<()>;
    async fn set_template_build_state(
        &self,
        id: TemplateId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()>;
    /// Most recently created finished template for the architecture
    async fn finished_template_for(&self, arch: &str) -> Result<Option<HostTemplate>>;

    async fn resolution_for(&self, ip: IpAddr) -> Result<Option<AddressResolution>>;
    /// Insert or replace the record for its ip (ip is unique)
    async fn upsert_resolution(&self, resolution: AddressResolution) -> Result<()>;

    /// Resolved name of an address, `None` without a record. Reverse
    /// lookups go through the resolution records, never live DNS.
    async fn hostname(&self, address: &Address) -> Result<Option<String>> {
        Ok(self.resolution_for(address.ip()).await?.map(|r| r.name))
    }
}
