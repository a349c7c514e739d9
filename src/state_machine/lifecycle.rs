//! Lifecycle State Machine
//!
//! Shared guarded lifecycle for hosts, guests, and host templates:
//! `pending → running → {finished|failed}`, with `not_started` as the
//! idle/reset state. Host deploys pass through `booting`; host and
//! template builds pass through `downloading` and `packaging`.
//!
//! States persist as byte codes. The codes are a storage contract and
//! must not be renumbered.
//!
//! An entity may have at most one in-flight lifecycle operation at a
//! time. This is enforced purely by the deployable-state guard on
//! `RequestStart` - there is no lock. A forced start can violate the
//! guard; that is the caller's responsibility.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{StateMachine, TransitionError, TransitionResult};

/// Lifecycle progress marker for build/deploy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LifecycleState {
    /// Operation accepted, job not yet picked up
    Pending,
    /// Job is executing
    Running,
    /// Build is packaging the artifact (builds only)
    Packaging,
    /// Build is downloading sources (builds only)
    Downloading,
    /// Host is rebooting into the new system (host deploy only)
    Booting,
    /// Last run completed successfully (terminal for the run)
    Finished,
    /// Last run failed (terminal for the run)
    Failed,
    /// No run has happened yet, or state was reset
    NotStarted,
}

impl LifecycleState {
    /// Storage code for this state
    pub fn code(self) -> u8 {
        match self {
            LifecycleState::Pending => 0x00,
            LifecycleState::Running => 0x01,
            LifecycleState::Packaging => 0x05,
            LifecycleState::Downloading => 0x10,
            LifecycleState::Booting => 0xe0,
            LifecycleState::Finished => 0xf0,
            LifecycleState::Failed => 0xf1,
            LifecycleState::NotStarted => 0xff,
        }
    }

    /// Decode a storage code. Unknown codes are a hard error.
    pub fn from_code(code: u8) -> Result<Self, TransitionError> {
        match code {
            0x00 => Ok(LifecycleState::Pending),
            0x01 => Ok(LifecycleState::Running),
            0x05 => Ok(LifecycleState::Packaging),
            0x10 => Ok(LifecycleState::Downloading),
            0xe0 => Ok(LifecycleState::Booting),
            0xf0 => Ok(LifecycleState::Finished),
            0xf1 => Ok(LifecycleState::Failed),
            0xff => Ok(LifecycleState::NotStarted),
            _ => Err(TransitionError::UnknownCode {
                code,
                entity: "lifecycle",
            }),
        }
    }

    /// Whether a new lifecycle operation may start from this state.
    ///
    /// Deployable states are exactly `{finished, failed, not_started}`;
    /// everything else means an operation is in flight.
    pub fn is_deployable(self) -> bool {
        matches!(
            self,
            LifecycleState::Finished | LifecycleState::Failed | LifecycleState::NotStarted
        )
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::NotStarted
    }
}

impl From<LifecycleState> for u8 {
    fn from(state: LifecycleState) -> u8 {
        state.code()
    }
}

impl TryFrom<u8> for LifecycleState {
    type Error = TransitionError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::Packaging => "packaging",
            LifecycleState::Downloading => "downloading",
            LifecycleState::Booting => "booting",
            LifecycleState::Finished => "finished",
            LifecycleState::Failed => "failed",
            LifecycleState::NotStarted => "not_started",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle command (FSM input)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    /// Ask to start a new run. Refused unless the current state is
    /// deployable or `force` is set.
    RequestStart { force: bool },
    /// Job picked up the pending run
    MarkRunning,
    /// Build entered the download phase
    Download,
    /// Build entered the packaging phase
    Package,
    /// Host deploy entered the reboot phase
    Boot,
    /// Run completed successfully
    Finish,
    /// Run failed. Always allowed.
    Fail,
    /// Reset to the idle state. Always allowed.
    Reset,
}

impl StateMachine for LifecycleState {
    type Input = LifecycleCommand;
    type Output = ();

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use LifecycleCommand::*;
        use LifecycleState::*;

        match (*self, input) {
            (state, RequestStart { force }) => {
                if state.is_deployable() || *force {
                    Ok((Pending, ()))
                } else {
                    Err(TransitionError::OperationInFlight(state.to_string()))
                }
            }
            (Pending, MarkRunning) => Ok((Running, ())),
            (Pending | Running, Download) => Ok((Downloading, ())),
            (Running | Downloading, Package) => Ok((Packaging, ())),
            (Running, Boot) => Ok((Booting, ())),
            (Pending | Running | Downloading | Packaging | Booting, Finish) => Ok((Finished, ())),
            (_, Fail) => Ok((Failed, ())),
            (_, Reset) => Ok((NotStarted, ())),
            (state, input) => Err(TransitionError::InvalidTransition {
                from: state.to_string(),
                to: format!("{input:?}"),
            }),
        }
    }

    fn valid_inputs(&self) -> Vec<Self::Input> {
        use LifecycleCommand::*;

        let all = [
            RequestStart { force: false },
            MarkRunning,
            Download,
            Package,
            Boot,
            Finish,
            Fail,
            Reset,
        ];
        all.into_iter()
            .filter(|input| self.can_transition(input))
            .collect()
    }
}

/// Code↔symbol table restricting which lifecycle states are legal for a
/// given entity field. Decoding a known code that is foreign to the
/// entity is as much an error as an unknown code.
#[derive(Debug, Clone, Copy)]
pub struct StateTable {
    entity: &'static str,
    allowed: &'static [LifecycleState],
}

impl StateTable {
    /// Entity name, for diagnostics
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Whether this entity may hold the given state
    pub fn allows(&self, state: LifecycleState) -> bool {
        self.allowed.contains(&state)
    }

    /// Decode a storage code against this entity's table
    pub fn decode(&self, code: u8) -> Result<LifecycleState, TransitionError> {
        let state = LifecycleState::from_code(code)?;
        if self.allows(state) {
            Ok(state)
        } else {
            Err(TransitionError::UnknownCode {
                code,
                entity: self.entity,
            })
        }
    }
}

/// Guest deploy states
pub const GUEST_DEPLOY_STATES: StateTable = StateTable {
    entity: "guest deploy",
    allowed: &[
        LifecycleState::Pending,
        LifecycleState::Running,
        LifecycleState::Finished,
        LifecycleState::Failed,
        LifecycleState::NotStarted,
    ],
};

/// Host deploy states (adds `booting`)
pub const HOST_DEPLOY_STATES: StateTable = StateTable {
    entity: "host deploy",
    allowed: &[
        LifecycleState::Pending,
        LifecycleState::Running,
        LifecycleState::Booting,
        LifecycleState::Finished,
        LifecycleState::Failed,
        LifecycleState::NotStarted,
    ],
};

/// Host build states (adds `packaging` and `downloading`)
pub const HOST_BUILD_STATES: StateTable = StateTable {
    entity: "host build",
    allowed: &[
        LifecycleState::Pending,
        LifecycleState::Running,
        LifecycleState::Packaging,
        LifecycleState::Downloading,
        LifecycleState::Finished,
        LifecycleState::Failed,
        LifecycleState::NotStarted,
    ],
};

/// Host template build states
pub const TEMPLATE_BUILD_STATES: StateTable = StateTable {
    entity: "host template build",
    allowed: &[
        LifecycleState::Pending,
        LifecycleState::Running,
        LifecycleState::Packaging,
        LifecycleState::Downloading,
        LifecycleState::Finished,
        LifecycleState::Failed,
        LifecycleState::NotStarted,
    ],
};
