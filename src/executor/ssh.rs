//! SSH-backed [`RemoteSession`]
//!
//! Connects as root, with the initial root password while a host is
//! still factory fresh and with the deploy key afterwards. File
//! transfer runs over an SFTP sub-channel that is always torn down
//! before the next command channel opens.

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ExecOutcome, RemoteSession};
use crate::config::CloudConfig;
use crate::domain::Host;
use crate::errors::{Error, Result};

struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    // Hosts are installed by this control plane; their keys rotate on
    // every reinstall
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A root SSH session on one host
pub struct SshSession {
    handle: client::Handle<AcceptingHandler>,
    host_name: String,
}

impl SshSession {
    /// Connect to a host, picking address and credentials from its
    /// provisioning state: password auth against the primary address
    /// while `initial_root_pw` is set, key auth afterwards.
    pub async fn connect(config: &CloudConfig, host: &Host) -> Result<Self> {
        let (address, password): (IpAddr, Option<&str>) = match host.initial_root_pw.as_deref() {
            Some(pw) => (host.primary_address.ip(), Some(pw)),
            None => {
                let address = if config.use_external_ip {
                    host.primary_address.ip()
                } else {
                    host.private_address()
                        .map(IpAddr::V4)
                        .ok_or_else(|| {
                            Error::Configuration(format!(
                                "host {} has no private address",
                                host.name
                            ))
                        })?
                };
                (address, None)
            }
        };

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        debug!("Connecting to host {} at {}", host.name, address);
        let mut handle = client::connect(ssh_config, (address, 22), AcceptingHandler)
            .await
            .map_err(|e| Error::Transport(format!("connect to {}: {e}", host.name)))?;

        let authenticated = match password {
            Some(pw) => handle
                .authenticate_password("root", pw)
                .await
                .map_err(|e| Error::Transport(format!("password auth: {e}")))?,
            None => {
                let key_path = config.ssh_key_path();
                let key = russh_keys::load_secret_key(&key_path, None).map_err(|e| {
                    Error::Configuration(format!(
                        "ssh key {}: {e}",
                        key_path.display()
                    ))
                })?;
                handle
                    .authenticate_publickey("root", Arc::new(key))
                    .await
                    .map_err(|e| Error::Transport(format!("publickey auth: {e}")))?
            }
        };

        if !authenticated {
            return Err(Error::Transport(format!(
                "authentication rejected by host {}",
                host.name
            )));
        }

        Ok(Self {
            handle,
            host_name: host.name.clone(),
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutcome> {
        debug!("EXEC [{}]: {}", self.host_name, command);

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transport(format!("open channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Transport(format!("exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    stderr.entry(ext).or_default().extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let success = exit_status == Some(0);
        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        if !success {
            // Failure diagnostics carry both streams
            output.push_str("\n\n");
            let stderr_text = stderr
                .values()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect::<Vec<_>>()
                .join("\n");
            output.push_str(&stderr_text);
        }

        Ok(ExecOutcome { success, output })
    }

    async fn write_file(&mut self, path: &str, mode: u32, content: &str) -> Result<()> {
        debug!("WRITE [{}]: {} ({:o})", self.host_name, path, mode);

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transport(format!("open sftp channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Transport(format!("request sftp: {e}")))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Transport(format!("sftp session: {e}")))?;

        // The handle is closed on every path out of here, and
        // permissions are only set once the content is fully written
        let write_result: Result<()> = async {
            let mut file = sftp
                .open_with_flags(
                    path,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| Error::Transport(format!("open {path}: {e}")))?;

            let written = file.write_all(content.as_bytes()).await;
            let flushed = file.shutdown().await;
            written.map_err(|e| Error::Transport(format!("write {path}: {e}")))?;
            flushed.map_err(|e| Error::Transport(format!("close {path}: {e}")))?;

            let attrs = FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            };
            sftp.set_metadata(path, attrs)
                .await
                .map_err(|e| Error::Transport(format!("chmod {path}: {e}")))?;
            Ok(())
        }
        .await;

        // Tear the sub-channel down before any further command runs
        let closed = sftp
            .close()
            .await
            .map_err(|e| Error::Transport(format!("close sftp: {e}")));
        write_result?;
        closed?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::Transport(format!("disconnect: {e}")))?;
        Ok(())
    }
}
