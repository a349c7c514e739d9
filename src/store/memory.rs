//! In-memory store
//!
//! Backs tests and examples. Enforces the same uniqueness invariants a
//! production document store would check with unique indexes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

use super::Store;
use crate::domain::{
    AddressResolution, Guest, GuestId, Host, HostId, HostTemplate, TemplateId,
};
use crate::errors::{Error, Result};
use crate::state_machine::LifecycleState;

#[derive(Default)]
struct Collections {
    hosts: BTreeMap<HostId, Host>,
    guests: BTreeMap<GuestId, Guest>,
    templates: BTreeMap<TemplateId, HostTemplate>,
    resolutions: BTreeMap<IpAddr, AddressResolution>,
}

/// In-memory [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_host_unique(collections: &Collections, host: &Host) -> Result<()> {
    for other in collections.hosts.values() {
        if other.id == host.id {
            continue;
        }
        if other.name == host.name {
            return Err(Error::Conflict(format!(
                "host name {:?} already taken",
                host.name
            )));
        }
        if host.mac_address_prefix.is_some()
            && other.mac_address_prefix == host.mac_address_prefix
        {
            return Err(Error::Conflict(format!(
                "mac prefix {} already taken",
                host.mac_address_prefix.expect("checked above")
            )));
        }
    }
    Ok(())
}

fn check_guest_unique(collections: &Collections, guest: &Guest) -> Result<()> {
    for other in collections.guests.values() {
        if other.id == guest.id || other.host_id != guest.host_id {
            continue;
        }
        if other.name == guest.name {
            return Err(Error::Conflict(format!(
                "guest name {:?} already taken on host",
                guest.name
            )));
        }
        if guest.private_address.is_some() && other.private_address == guest.private_address {
            return Err(Error::Conflict(format!(
                "private address {} already taken on host",
                guest.private_address.expect("checked above")
            )));
        }
        if guest.mac_address.is_some() && other.mac_address == guest.mac_address {
            return Err(Error::Conflict(format!(
                "mac address {} already taken on host",
                guest.mac_address.expect("checked above")
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn hosts(&self) -> Result<Vec<Host>> {
        Ok(self.inner.read().await.hosts.values().cloned().collect())
    }

    async fn host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.inner.read().await.hosts.get(&id).cloned())
    }

    async fn insert_host(&self, host: Host) -> Result<()> {
        let mut inner = self.inner.write().await;
        check_host_unique(&inner, &host)?;
        inner.hosts.insert(host.id, host);
        Ok(())
    }

    async fn update_host(&self, host: Host) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.hosts.contains_key(&host.id) {
            return Err(Error::NotFound(format!("host {}", host.id)));
        }
        check_host_unique(&inner, &host)?;
        inner.hosts.insert(host.id, host);
        Ok(())
    }

    async fn set_host_deploy_state(
        &self,
        id: HostId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("host {id}")))?;
        host.deploy_state = state;
        if issue.is_some() {
            host.deploy_last_issue = issue;
        }
        Ok(())
    }

    async fn set_host_build_state(
        &self,
        id: HostId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("host {id}")))?;
        host.build_state = state;
        if issue.is_some() {
            host.build_last_issue = issue;
        }
        Ok(())
    }

    async fn guest(&self, id: GuestId) -> Result<Option<Guest>> {
        Ok(self.inner.read().await.guests.get(&id).cloned())
    }

    async fn guests_of(&self, host_id: HostId) -> Result<Vec<Guest>> {
        Ok(self
            .inner
            .read()
            .await
            .guests
            .values()
            .filter(|g| g.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn insert_guest(&self, guest: Guest) -> Result<()> {
        let mut inner = self.inner.write().await;
        check_guest_unique(&inner, &guest)?;
        inner.guests.insert(guest.id, guest);
        Ok(())
    }

    async fn update_guest(&self, guest: Guest) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.guests.contains_key(&guest.id) {
            return Err(Error::NotFound(format!("guest {}", guest.id)));
        }
        check_guest_unique(&inner, &guest)?;
        inner.guests.insert(guest.id, guest);
        Ok(())
    }

    async fn delete_guest(&self, id: GuestId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .guests
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))?;
        Ok(())
    }

    async fn set_guest_deploy_state(
        &self,
        id: GuestId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let guest = inner
            .guests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))?;
        guest.deploy_state = state;
        if issue.is_some() {
            guest.deploy_last_issue = issue;
        }
        Ok(())
    }

    async fn set_guests_deploy_state(
        &self,
        ids: &[GuestId],
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()> {
        // One write-lock scope, so the batch is a single atomic write
        let mut inner = self.inner.write().await;
        for id in ids {
            if let Some(guest) = inner.guests.get_mut(id) {
                guest.deploy_state = state;
                if issue.is_some() {
                    guest.deploy_last_issue = issue.clone();
                }
            }
        }
        Ok(())
    }

    async fn existing_guest_ids(&self, ids: &[GuestId]) -> Result<Vec<GuestId>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| inner.guests.contains_key(id))
            .copied()
            .collect())
    }

    async fn template(&self, id: TemplateId) -> Result<Option<HostTemplate>> {
        Ok(self.inner.read().await.templates.get(&id).cloned())
    }

    async fn insert_template(&self, template: HostTemplate) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.templates.insert(template.id, template);
        Ok(())
    }

    async fn set_template_build_state(
        &self,
        id: TemplateId,
        state: LifecycleState,
        issue: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let template = inner
            .templates
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;
        template.build_state = state;
        if issue.is_some() {
            template.build_last_issue = issue;
        }
        Ok(())
    }

    async fn finished_template_for(&self, arch: &str) -> Result<Option<HostTemplate>> {
        Ok(self
            .inner
            .read()
            .await
            .templates
            .values()
            .filter(|t| t.arch == arch && t.build_state == LifecycleState::Finished)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn resolution_for(&self, ip: IpAddr) -> Result<Option<AddressResolution>> {
        Ok(self.inner.read().await.resolutions.get(&ip).cloned())
    }

    async fn upsert_resolution(&self, resolution: AddressResolution) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.resolutions.insert(resolution.ip, resolution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, MacAddress, MacPrefix};
    use std::net::Ipv4Addr;

    fn host(name: &str, prefix: u16) -> Host {
        let mut host = Host::new(
            name,
            Address::new("198.51.100.10").unwrap(),
            Address::new("10.42.0.0/24").unwrap(),
        )
        .unwrap();
        host.mac_address_prefix = Some(MacPrefix::from_value(prefix));
        host
    }

    #[tokio::test]
    async fn host_name_uniqueness() {
        let store = MemoryStore::new();
        store.insert_host(host("h1", 1)).await.unwrap();

        let err = store.insert_host(host("h1", 2)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn host_mac_prefix_uniqueness() {
        let store = MemoryStore::new();
        store.insert_host(host("h1", 1)).await.unwrap();

        let err = store.insert_host(host("h2", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn guest_private_address_unique_per_host() {
        let store = MemoryStore::new();
        let h = host("h1", 1);
        let host_id = h.id;
        store.insert_host(h).await.unwrap();

        let mut g1 = Guest::new(host_id, "g1").unwrap();
        g1.private_address = Some(Ipv4Addr::new(10, 42, 0, 23));
        store.insert_guest(g1).await.unwrap();

        let mut g2 = Guest::new(host_id, "g2").unwrap();
        g2.private_address = Some(Ipv4Addr::new(10, 42, 0, 23));
        let err = store.insert_guest(g2).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Same address on a different host is fine
        let other = host("h2", 2);
        let other_id = other.id;
        store.insert_host(other).await.unwrap();
        let mut g3 = Guest::new(other_id, "g1").unwrap();
        g3.private_address = Some(Ipv4Addr::new(10, 42, 0, 23));
        store.insert_guest(g3).await.unwrap();
    }

    #[tokio::test]
    async fn guest_mac_unique_per_host() {
        let store = MemoryStore::new();
        let h = host("h1", 1);
        let host_id = h.id;
        store.insert_host(h).await.unwrap();

        let mac = MacAddress::new("00:16:3e:00:01:01").unwrap();
        let mut g1 = Guest::new(host_id, "g1").unwrap();
        g1.mac_address = Some(mac);
        store.insert_guest(g1).await.unwrap();

        let mut g2 = Guest::new(host_id, "g2").unwrap();
        g2.mac_address = Some(mac);
        assert!(matches!(
            store.insert_guest(g2).await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn pending_update_keeps_previous_issue() {
        let store = MemoryStore::new();
        let h = host("h1", 1);
        let host_id = h.id;
        store.insert_host(h).await.unwrap();

        let guest = Guest::new(host_id, "g1").unwrap();
        let guest_id = guest.id;
        store.insert_guest(guest).await.unwrap();

        store
            .set_guest_deploy_state(
                guest_id,
                LifecycleState::Failed,
                Some("boom".to_string()),
            )
            .await
            .unwrap();
        store
            .set_guest_deploy_state(guest_id, LifecycleState::Pending, None)
            .await
            .unwrap();

        let guest = store.guest(guest_id).await.unwrap().unwrap();
        assert_eq!(guest.deploy_state, LifecycleState::Pending);
        assert_eq!(guest.deploy_last_issue.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn finished_template_picks_latest() {
        let store = MemoryStore::new();
        let mut old = HostTemplate::new("amd64");
        old.build_state = LifecycleState::Finished;
        let mut new = HostTemplate::new("amd64");
        new.build_state = LifecycleState::Finished;
        new.created_at = old.created_at + chrono::Duration::seconds(10);
        let newest_id = new.id;
        let mut unfinished = HostTemplate::new("amd64");
        unfinished.build_state = LifecycleState::Running;
        unfinished.created_at = new.created_at + chrono::Duration::seconds(10);

        store.insert_template(old).await.unwrap();
        store.insert_template(new).await.unwrap();
        store.insert_template(unfinished).await.unwrap();

        let found = store.finished_template_for("amd64").await.unwrap().unwrap();
        assert_eq!(found.id, newest_id);
        assert!(store.finished_template_for("arm64").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hostname_comes_from_resolution_records() {
        let store = MemoryStore::new();
        let address = Address::new("198.51.100.10").unwrap();
        assert_eq!(store.hostname(&address).await.unwrap(), None);

        let record = AddressResolution::new(address.ip(), "node1.example.com").unwrap();
        store.upsert_resolution(record).await.unwrap();
        assert_eq!(
            store.hostname(&address).await.unwrap().as_deref(),
            Some("node1.example.com")
        );

        // Upsert replaces the record for the same ip
        let renamed = AddressResolution::new(address.ip(), "node2.example.com").unwrap();
        store.upsert_resolution(renamed).await.unwrap();
        assert_eq!(
            store.hostname(&address).await.unwrap().as_deref(),
            Some("node2.example.com")
        );
    }
}
