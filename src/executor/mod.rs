//! Remote Executor
//!
//! Runs shell commands on a host over an authenticated session and
//! returns a structured result. One session per host is reused across
//! calls within a logical operation; command execution and file
//! transfer are mutually exclusive sub-channels on that session.

pub mod ssh;

pub use ssh::SshSession;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::errors::{Error, Result};

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Stdout on success; `stdout + "\n\n" + stderr` on failure
    pub output: String,
}

impl ExecOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// An authenticated command/file session on a single host.
///
/// Calls are blocking and serialize per session: a host must never have
/// two command channels open concurrently on the same session.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a shell command, capturing stdout and stderr separately.
    async fn exec(&mut self, command: &str) -> Result<ExecOutcome>;

    /// Write a remote file with the given permission bits. The remote
    /// handle is closed on every exit path; permissions are only
    /// applied after a complete write, so an interrupted transfer never
    /// leaves an executable fragment behind.
    async fn write_file(&mut self, path: &str, mode: u32, content: &str) -> Result<()>;

    /// Close the session
    async fn close(&mut self) -> Result<()>;
}

/// Run a command and fail loudly when it does not succeed. Used where
/// the caller has no recovery path.
pub async fn exec_or_fail(
    session: &mut dyn RemoteSession,
    command: &str,
    message: &str,
) -> Result<String> {
    let outcome = session.exec(command).await?;
    if outcome.success {
        Ok(outcome.output)
    } else {
        Err(Error::Remote {
            message: message.to_string(),
            output: outcome.output,
        })
    }
}

/// Live state of a remote domain/container, per the hypervisor's own
/// state table. `Undefined` doubles as "query failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Undefined,
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    /// Numeric state id as reported to monitoring
    pub fn id(self) -> i8 {
        match self {
            DomainState::Undefined => -1,
            DomainState::NoState => 0,
            DomainState::Running => 1,
            DomainState::Blocked => 2,
            DomainState::Paused => 3,
            DomainState::Shutdown => 4,
            DomainState::Shutoff => 5,
            DomainState::Crashed => 6,
            DomainState::Suspended => 7,
        }
    }

    /// Parse `virsh domstate` output; anything unrecognized maps to
    /// `Undefined`
    pub fn parse(output: &str) -> Self {
        match output.trim().replace(' ', "_").as_str() {
            "no_state" => DomainState::NoState,
            "running" => DomainState::Running,
            "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "shutdown" | "in_shutdown" => DomainState::Shutdown,
            "shutoff" | "shut_off" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "suspended" | "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Undefined,
        }
    }

    /// Whether the domain is gone as far as teardown is concerned
    pub fn is_down(self) -> bool {
        matches!(self, DomainState::Undefined | DomainState::Shutoff)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainState::Undefined => "undefined",
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shut off",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// Check whether something is mounted at `root`/`mountpoint` by pattern
/// matching `mount` output
pub async fn mounted_at(
    session: &mut dyn RemoteSession,
    mountpoint: &str,
    root: &str,
) -> Result<bool> {
    let outcome = session.exec("mount").await?;
    let needle = format!(
        "on {}/{} type",
        root.trim_end_matches('/'),
        mountpoint.trim_start_matches('/')
    );
    Ok(outcome.output.contains(&needle))
}

/// Whether the boot filesystem is mounted below `root`
pub async fn boot_fs_mounted(session: &mut dyn RemoteSession, root: &str) -> Result<bool> {
    mounted_at(session, "/boot", root).await
}

/// Mount the boot filesystem below `root`. No-op if already mounted.
/// Falls back to the rescue array device when the primary fails.
pub async fn mount_boot_fs(session: &mut dyn RemoteSession, root: &str) -> Result<bool> {
    if boot_fs_mounted(session, root).await? {
        return Ok(true);
    }

    let outcome = session
        .exec(&format!("mkdir -p {root}/boot && mount /dev/md0 {root}/boot"))
        .await?;
    if outcome.success {
        return Ok(true);
    }

    let fallback = session
        .exec(&format!("mount /dev/md/rescue:0 {root}/boot"))
        .await?;
    Ok(fallback.success)
}

/// Unmount the boot filesystem below `root`
pub async fn unmount_boot_fs(session: &mut dyn RemoteSession, root: &str) -> Result<bool> {
    Ok(session.exec(&format!("umount {root}/boot")).await?.success)
}

/// Query the live state of a domain. A failed query (e.g. the domain
/// was never defined) reports `Undefined` rather than erroring, which
/// is what makes unconditional teardown safe.
pub async fn domain_state(session: &mut dyn RemoteSession, name: &str) -> Result<DomainState> {
    let outcome = session.exec(&format!("virsh domstate {name}")).await?;
    if outcome.success {
        Ok(DomainState::parse(&outcome.output))
    } else {
        Ok(DomainState::Undefined)
    }
}

/// Shut a domain down. No-op returning success if it is not running,
/// unless `force` is set.
pub async fn stop_domain(
    session: &mut dyn RemoteSession,
    name: &str,
    force: bool,
) -> Result<bool> {
    let state = domain_state(session, name).await?;
    if state != DomainState::Running && !force {
        debug!("Domain {} is {}, nothing to stop", name, state);
        return Ok(true);
    }
    Ok(session.exec(&format!("virsh shutdown {name}")).await?.success)
}

/// Default timeout for [`wait_for_stop`]
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll until the domain is down or the timeout expires.
///
/// Expiry is not an error: the last observed state is returned and the
/// caller must re-check before acting on it. There is no external
/// cancellation path; the only way out is the domain stopping or the
/// timeout expiring.
pub async fn wait_for_stop(
    session: &mut dyn RemoteSession,
    name: &str,
    timeout: Duration,
) -> Result<DomainState> {
    let mut attempts_left = (timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1);
    loop {
        let state = domain_state(session, name).await?;
        if state.is_down() {
            return Ok(state);
        }
        attempts_left -= 1;
        if attempts_left == 0 {
            debug!("Domain {} still {} after timeout", name, state);
            return Ok(state);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Stop and undefine a domain. Returns success immediately, without
/// side effects, if the domain was never defined - teardown is safe to
/// call unconditionally.
pub async fn undefine_domain(
    session: &mut dyn RemoteSession,
    name: &str,
    timeout: Duration,
) -> Result<bool> {
    if domain_state(session, name).await? == DomainState::Undefined {
        debug!("Domain {} was not defined before", name);
        return Ok(true);
    }

    stop_domain(session, name, false).await?;
    wait_for_stop(session, name, timeout).await?;

    Ok(session.exec(&format!("virsh undefine {name}")).await?.success)
}
