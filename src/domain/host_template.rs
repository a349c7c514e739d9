//! Host Template Entity
//!
//! An OS image description. Building a template produces a tarball
//! artifact that guest containers are created from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HasIssues, TemplateId};
use crate::state_machine::LifecycleState;

/// Host template aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTemplate {
    pub id: TemplateId,

    /// CPU architecture the image targets
    pub arch: String,

    /// OS version the image was built from
    pub os_version: Option<String>,

    pub build_state: LifecycleState,
    pub build_last_issue: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostTemplate {
    /// Create a template for the given architecture
    pub fn new(arch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::new(),
            arch: arch.into(),
            os_version: None,
            build_state: LifecycleState::default(),
            build_last_issue: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a new build may start
    pub fn buildable(&self) -> bool {
        self.build_state.is_deployable()
    }

    /// Path of the built tarball artifact on the host
    pub fn tarball(&self) -> String {
        format!("/cloud/templates/host/{}.tar.gz", self.id)
    }
}

impl HasIssues for HostTemplate {
    fn last_issue(&self) -> Option<&str> {
        self.build_last_issue.as_deref()
    }

    fn set_last_issue(&mut self, issue: Option<String>) {
        self.build_last_issue = issue;
        self.updated_at = Utc::now();
    }
}
