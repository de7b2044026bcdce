//! Second-hop transport to the upstream host.
//!
//! The session proxy only talks to the traits in this module; [`SshConnector`]
//! implements them with `russh::client`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Msg};
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Sig};
use tracing::{debug, info, warn};

use crate::context::PtyRequest;
use crate::error::Error;

/// Resolved connection parameters for one task.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Target {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Something that happened on an upstream session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Data(Vec<u8>),
    /// Extended data; type 1 is stderr.
    ExtendedData { ext: u32, data: Vec<u8> },
    Eof,
    ExitStatus(u32),
    /// Signal name without the `SIG` prefix, e.g. `TERM`.
    ExitSignal(String),
    Close,
}

/// Opens authenticated connections to upstream hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn UpstreamConnection>, Error>;
}

#[async_trait]
pub trait UpstreamConnection: Send {
    async fn open_session(&mut self) -> Result<Box<dyn UpstreamChannel>, Error>;

    /// Disconnect; errors are logged, not returned.
    async fn close(&mut self);
}

#[async_trait]
pub trait UpstreamChannel: Send {
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), Error>;

    async fn exec(&mut self, command: &str) -> Result<(), Error>;

    async fn shell(&mut self) -> Result<(), Error>;

    async fn send(&mut self, data: &[u8]) -> Result<(), Error>;

    async fn send_eof(&mut self) -> Result<(), Error>;

    /// Next event, or `None` once the channel is gone.
    async fn wait(&mut self) -> Option<UpstreamEvent>;

    async fn close(&mut self);
}

/// [`Connector`] over SSH with password authentication.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            // No dial or inactivity deadline: a task lasts as long as the upstream session.
            config: Arc::new(client::Config {
                inactivity_timeout: None,
                nodelay: true,
                ..Default::default()
            }),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Client handler that accepts whatever host key the upstream presents.
struct AcceptAnyHostKey {
    address: String,
}

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        warn!(
            target_addr = %self.address,
            algo = %key.algorithm(),
            fp = %key.fingerprint(HashAlg::Sha256),
            "accepting upstream host key without verification"
        );
        Ok(true)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn UpstreamConnection>, Error> {
        let address = target.address();
        info!(target_addr = %address, user = %target.user, "connecting to remote server");

        let handler = AcceptAnyHostKey {
            address: address.clone(),
        };
        let mut handle = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| Error::transport("cannot connect to remote server", e))?;

        let auth = handle
            .authenticate_password(target.user.clone(), target.password.clone())
            .await
            .map_err(|e| Error::transport("cannot authenticate at remote server", e))?;
        if let AuthResult::Failure { .. } = auth {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(target_addr = %address, "disconnect after failed auth failed: {}", e);
            }
            return Err(Error::transport(
                "cannot authenticate at remote server",
                format!("password rejected for user '{}'", target.user),
            ));
        }

        debug!(target_addr = %address, "authenticated at remote server");
        Ok(Box::new(SshConnection { handle, address }))
    }
}

struct SshConnection {
    handle: client::Handle<AcceptAnyHostKey>,
    address: String,
}

#[async_trait]
impl UpstreamConnection for SshConnection {
    async fn open_session(&mut self) -> Result<Box<dyn UpstreamChannel>, Error> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::transport("cannot create SSH session", e))?;
        Ok(Box::new(SshChannel { channel }))
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(target_addr = %self.address, "disconnect from remote server failed: {}", e);
        }
    }
}

struct SshChannel {
    channel: russh::Channel<Msg>,
}

#[async_trait]
impl UpstreamChannel for SshChannel {
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), Error> {
        // Terminal modes are not forwarded.
        self.channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| Error::transport("cannot request PTY", e))
    }

    async fn exec(&mut self, command: &str) -> Result<(), Error> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| Error::transport("cannot execute command", e))
    }

    async fn shell(&mut self) -> Result<(), Error> {
        self.channel
            .request_shell(true)
            .await
            .map_err(|e| Error::transport("cannot request shell", e))
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.channel
            .data(data)
            .await
            .map_err(|e| Error::transport("cannot send data to remote server", e))
    }

    async fn send_eof(&mut self) -> Result<(), Error> {
        self.channel
            .eof()
            .await
            .map_err(|e| Error::transport("cannot send EOF to remote server", e))
    }

    async fn wait(&mut self) -> Option<UpstreamEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => UpstreamEvent::Data(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext } => UpstreamEvent::ExtendedData {
                    ext,
                    data: data.to_vec(),
                },
                ChannelMsg::Eof => UpstreamEvent::Eof,
                ChannelMsg::Close => UpstreamEvent::Close,
                ChannelMsg::ExitStatus { exit_status } => UpstreamEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    UpstreamEvent::ExitSignal(signal_label(&signal_name))
                }
                other => {
                    debug!("ignoring upstream channel message: {:?}", other);
                    continue;
                }
            };
            return Some(event);
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(channel = ?self.channel.id(), "closing upstream channel failed: {}", e);
        }
    }
}

fn signal_label(sig: &Sig) -> String {
    match sig {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.clone(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}


#[cfg(test)]
pub(crate) mod testing {
    //! In-memory upstream that replays scripted events and records calls.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Connect(Target),
        OpenSession,
        RequestPty(PtyRequest),
        Exec(String),
        Shell,
        Send(Vec<u8>),
        SendEof,
        CloseChannel,
        CloseConnection,
    }

    #[derive(Clone, Default)]
    pub struct CallLog(Arc<Mutex<Vec<Call>>>);

    impl CallLog {
        fn push(&self, call: Call) {
            self.0.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }

        /// Calls other than stream traffic, in order.
        pub fn control_calls(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| !matches!(c, Call::Send(_) | Call::SendEof))
                .collect()
        }
    }

    /// Connector whose every connection replays the same events.
    pub struct ScriptedConnector {
        pub log: CallLog,
        events: Vec<UpstreamEvent>,
        refuse: bool,
        refuse_channels: bool,
        hold_until_eof: bool,
    }

    impl ScriptedConnector {
        pub fn new(events: Vec<UpstreamEvent>) -> Self {
            Self {
                log: CallLog::default(),
                events,
                refuse: false,
                refuse_channels: false,
                hold_until_eof: false,
            }
        }

        /// Connects, but every session channel open fails.
        pub fn refusing_channels() -> Self {
            Self {
                refuse_channels: true,
                ..Self::new(Vec::new())
            }
        }

        /// Channels release no events before the client side sent EOF.
        pub fn hold_until_eof(mut self) -> Self {
            self.hold_until_eof = true;
            self
        }

        /// Exits with `status` and closes.
        pub fn exiting(status: u32) -> Self {
            Self::new(vec![UpstreamEvent::ExitStatus(status), UpstreamEvent::Close])
        }

        pub fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, target: &Target) -> Result<Box<dyn UpstreamConnection>, Error> {
            self.log.push(Call::Connect(target.clone()));
            if self.refuse {
                return Err(Error::transport(
                    "cannot connect to remote server",
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ));
            }
            Ok(Box::new(ScriptedConnection {
                log: self.log.clone(),
                events: self.events.clone(),
                refuse_channels: self.refuse_channels,
                hold_until_eof: self.hold_until_eof,
            }))
        }
    }

    struct ScriptedConnection {
        log: CallLog,
        events: Vec<UpstreamEvent>,
        refuse_channels: bool,
        hold_until_eof: bool,
    }

    #[async_trait]
    impl UpstreamConnection for ScriptedConnection {
        async fn open_session(&mut self) -> Result<Box<dyn UpstreamChannel>, Error> {
            self.log.push(Call::OpenSession);
            if self.refuse_channels {
                return Err(Error::transport(
                    "cannot create SSH session",
                    "channel open refused",
                ));
            }
            Ok(Box::new(ScriptedChannel {
                log: self.log.clone(),
                events: self.events.clone().into(),
                hold_until_eof: self.hold_until_eof,
                eof_received: false,
            }))
        }

        async fn close(&mut self) {
            self.log.push(Call::CloseConnection);
        }
    }

    pub struct ScriptedChannel {
        log: CallLog,
        events: VecDeque<UpstreamEvent>,
        hold_until_eof: bool,
        eof_received: bool,
    }

    impl ScriptedChannel {
        pub fn new(events: Vec<UpstreamEvent>) -> (Self, CallLog) {
            let log = CallLog::default();
            let channel = Self {
                log: log.clone(),
                events: events.into(),
                hold_until_eof: false,
                eof_received: false,
            };
            (channel, log)
        }

        /// Release no events before the client side sent EOF.
        pub fn hold_until_eof(mut self) -> Self {
            self.hold_until_eof = true;
            self
        }
    }

    #[async_trait]
    impl UpstreamChannel for ScriptedChannel {
        async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), Error> {
            self.log.push(Call::RequestPty(pty.clone()));
            Ok(())
        }

        async fn exec(&mut self, command: &str) -> Result<(), Error> {
            self.log.push(Call::Exec(command.to_string()));
            Ok(())
        }

        async fn shell(&mut self) -> Result<(), Error> {
            self.log.push(Call::Shell);
            Ok(())
        }

        async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
            self.log.push(Call::Send(data.to_vec()));
            Ok(())
        }

        async fn send_eof(&mut self) -> Result<(), Error> {
            self.log.push(Call::SendEof);
            self.eof_received = true;
            Ok(())
        }

        async fn wait(&mut self) -> Option<UpstreamEvent> {
            if self.hold_until_eof && !self.eof_received {
                std::future::pending::<()>().await;
            }
            self.events.pop_front()
        }

        async fn close(&mut self) {
            self.log.push(Call::CloseChannel);
        }
    }
}
