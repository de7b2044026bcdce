//! Inbound SSH server using russh.
//!
//! Handles:
//! - Password authentication against configured users
//! - Flow selection and one session proxy per connection
//! - Session channels (shell, exec, subsystems) relayed through the proxy
//! - Local port forwarding (direct-tcpip) gated by the proxy

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use russh::server::{self, Auth, Handler, Msg};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{Proxy, Repository};
use crate::config::GatewayConfig;
use crate::context::{
    Authorization, HostPort, PtyRequest, Request, Session, Task, TaskIo, TaskType,
};
use crate::error::Error;

/// Exit status reported to the client when a task failed instead of exiting.
const FAILED_TASK_STATUS: u32 = 255;

const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    /// One repository per configured flow, in configuration order.
    pub repositories: Vec<Repository>,
}

impl ServerState {
    pub fn new(config: Arc<GatewayConfig>, repositories: Vec<Repository>) -> Self {
        Self {
            config,
            repositories,
        }
    }

    /// First flow that lists `user` and whose repository accepts the request.
    ///
    /// The returned request already carries a fresh session.
    pub fn route(&self, user: &str, peer_addr: Option<SocketAddr>) -> Option<(Repository, Request)> {
        let flows = self.config.flows.iter().zip(&self.repositories);
        for (flow, repository) in flows {
            if !flow.applies_to(user) {
                continue;
            }

            let session = Arc::new(Session::new(flow.name.clone(), user, peer_addr));
            let authorization =
                Authorization::new(user, flow.name.clone()).with_session(session);
            let request = Request::new(authorization, peer_addr);

            match repository.acceptance_check(&request) {
                Ok(true) => return Some((repository.clone(), request)),
                Ok(false) => debug!(flow = %flow.name, user, "flow does not accept user"),
                Err(e) => warn!(flow = %flow.name, user, "acceptance check failed: {}", e),
            }
        }
        None
    }
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,

    peer_addr: SocketAddr,

    /// Request established at authentication, with its session.
    request: Option<Request>,

    /// Proxy for this connection's session (set after auth).
    proxy: Option<Arc<Proxy>>,

    /// Held while a task runs; tasks of one session run one after another.
    task_gate: Arc<Semaphore>,

    channels: HashMap<ChannelId, ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    pty: Option<PtyRequest>,
    env_vars: BTreeMap<String, String>,
    task_started: bool,
    /// Client input for the running task; dropped on client EOF.
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelState {
    /// Input hand-off for a new task, or `None` if the channel already has one.
    fn begin_task(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        if self.task_started {
            return None;
        }
        self.task_started = true;
        let (tx, rx) = mpsc::unbounded_channel();
        self.stdin = Some(tx);
        Some(rx)
    }
}

/// Map a subsystem name to the task it runs.
fn subsystem_task(name: &str) -> TaskType {
    match name {
        "sftp" => TaskType::Sftp,
        other => TaskType::Subsystem(other.to_string()),
    }
}

/// Command line of an exec request. Commands that are not UTF-8 are refused
/// rather than rewritten.
fn exec_command(data: &[u8]) -> Result<String> {
    let command = std::str::from_utf8(data).context("exec command is not valid UTF-8")?;
    Ok(command.to_string())
}

/// Where a running task's output and result go.
#[async_trait]
trait ChannelOutput: Send + Sync {
    async fn data(&self, data: &[u8]) -> Result<()>;

    async fn extended_data(&self, ext: u32, data: &[u8]) -> Result<()>;

    async fn exit_status(&self, status: u32) -> Result<()>;

    async fn eof(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A session channel of the inbound connection.
struct SessionChannel {
    handle: server::Handle,
    id: ChannelId,
}

impl SessionChannel {
    fn closed(&self) -> anyhow::Error {
        anyhow!("channel {:?} is closed", self.id)
    }
}

#[async_trait]
impl ChannelOutput for SessionChannel {
    async fn data(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| self.closed())
    }

    async fn extended_data(&self, ext: u32, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.id, ext, CryptoVec::from_slice(data))
            .await
            .map_err(|_| self.closed())
    }

    async fn exit_status(&self, status: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.id, status)
            .await
            .map_err(|_| self.closed())
    }

    async fn eof(&self) -> Result<()> {
        self.handle.eof(self.id).await.map_err(|_| self.closed())
    }

    async fn close(&self) -> Result<()> {
        self.handle.close(self.id).await.map_err(|_| self.closed())
    }
}

/// Read ends of a task's stdout and stderr.
struct TaskOutput {
    stdout: DuplexStream,
    stderr: DuplexStream,
}

/// Streams for a task fed from `input`.
///
/// Input is queued without bound and written to the task from its own tokio
/// task, so the connection's session loop never waits on the task's stdin.
fn task_io(mut input: mpsc::UnboundedReceiver<Vec<u8>>) -> (TaskIo, TaskOutput) {
    let (mut stdin_tx, stdin_rx) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (stdout_tx, stdout_rx) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(STREAM_BUFFER_SIZE);

    tokio::spawn(async move {
        while let Some(data) = input.recv().await {
            if stdin_tx.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let io = TaskIo::new(Box::new(stdin_rx), Box::new(stdout_tx), Box::new(stderr_tx));
    let output = TaskOutput {
        stdout: stdout_rx,
        stderr: stderr_rx,
    };
    (io, output)
}

/// Banner written before an interactive shell with a terminal; empty otherwise.
fn task_banner(proxy: &Proxy, task: &Task) -> String {
    if task.kind != TaskType::Shell || !task.raw_command.is_empty() || task.pty.is_none() {
        return String::new();
    }
    match proxy.banner(&task.request) {
        Ok(banner) => banner,
        Err(e) => {
            warn!("Failed to render banner: {}", e);
            String::new()
        }
    }
}

/// Run one task and report its result on `sink`: exit status (255 when the
/// task failed), then EOF, then close.
async fn serve_task(
    proxy: Arc<Proxy>,
    gate: Arc<Semaphore>,
    task: Task,
    output: TaskOutput,
    sink: Arc<dyn ChannelOutput>,
) {
    // The gate is never closed, so the permit is always granted.
    let _permit = gate.acquire_owned().await;

    let banner = task_banner(&proxy, &task);
    if !banner.is_empty() {
        if let Err(e) = sink.data(banner.as_bytes()).await {
            debug!("Cannot write banner: {}", e);
        }
    }

    let stdout = tokio::spawn(pump_output(sink.clone(), None, output.stdout));
    let stderr = tokio::spawn(pump_output(
        sink.clone(),
        Some(EXTENDED_DATA_STDERR),
        output.stderr,
    ));

    let result = proxy.run_task(task).await;
    let _ = stdout.await;
    let _ = stderr.await;

    let exit_status = match result {
        Ok(status) => status,
        Err(e) => {
            warn!(session = %proxy.session_id(), "Task failed: {}", e);
            FAILED_TASK_STATUS
        }
    };
    if let Err(e) = sink.exit_status(exit_status).await {
        debug!("Cannot report exit status: {}", e);
    }
    if let Err(e) = sink.eof().await {
        debug!("Cannot send EOF: {}", e);
    }
    if let Err(e) = sink.close().await {
        debug!("Cannot close channel: {}", e);
    }
}

/// Copy task output to the client until the task drops its end.
async fn pump_output(sink: Arc<dyn ChannelOutput>, ext: Option<u32>, mut output: DuplexStream) {
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = match output.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let sent = match ext {
            Some(ext) => sink.extended_data(ext, &buf[..n]).await,
            None => sink.data(&buf[..n]).await,
        };
        if sent.is_err() {
            break;
        }
    }
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            request: None,
            proxy: None,
            task_gate: Arc::new(Semaphore::new(1)),
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
            partial_success: false,
        }
    }

    /// Request for a task on `channel_id`, including the env vars the client sent.
    fn task_request(&self, channel_id: ChannelId) -> Result<Request> {
        let mut request = self
            .request
            .clone()
            .ok_or_else(|| anyhow!("Not authenticated"))?;
        if let Some(state) = self.channels.get(&channel_id) {
            request
                .authorization
                .env_vars
                .extend(state.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(request)
    }

    /// Build the task for `channel_id` and run it in the background, then
    /// answer the request. A channel runs at most one task.
    fn start_task(
        &mut self,
        channel_id: ChannelId,
        kind: TaskType,
        raw_command: String,
        session: &mut server::Session,
    ) -> Result<()> {
        let proxy = self
            .proxy
            .clone()
            .ok_or_else(|| anyhow!("Not authenticated"))?;
        let request = self.task_request(channel_id)?;

        let state = self.channels.entry(channel_id).or_default();
        let Some(input) = state.begin_task() else {
            warn!("Channel {:?} already runs a task", channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let (io, output) = task_io(input);
        let task = Task {
            request,
            kind,
            pty: state.pty.clone(),
            raw_command,
            io,
        };
        let sink = Arc::new(SessionChannel {
            handle: session.handle(),
            id: channel_id,
        });
        tokio::spawn(serve_task(
            proxy,
            self.task_gate.clone(),
            task,
            output,
            sink,
        ));

        session.channel_success(channel_id)?;
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let known = self
            .server
            .config
            .find_user(user)
            .is_some_and(|u| u.verify_password(password));
        if !known {
            warn!(user, peer = %self.peer_addr, "Password rejected");
            return Ok(Self::reject());
        }

        let Some((repository, request)) = self.server.route(user, Some(self.peer_addr)) else {
            warn!(user, "No flow accepts user");
            return Ok(Self::reject());
        };

        let proxy = match repository.construct_for_session(&request) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(user, flow = %repository.flow(), "Cannot create session: {}", e);
                return Ok(Self::reject());
            }
        };

        info!(
            user,
            flow = %repository.flow(),
            session = %proxy.session_id(),
            peer = %self.peer_addr,
            "Authenticated"
        );
        self.request = Some(request);
        self.proxy = Some(Arc::new(proxy));
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        let pty = PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        };

        let supported = self
            .request
            .as_ref()
            .and_then(|r| r.authorization.find_session())
            .and_then(|s| {
                let flow = &s.flow;
                self.server.repositories.iter().find(|r| r.flow() == flow)
            })
            .is_some_and(|r| r.supports_pty(&pty));
        if !supported {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        self.channels.entry(channel_id).or_default().pty = Some(pty);
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!("Env request: channel={:?}, name={}", channel_id, variable_name);
        self.channels
            .entry(channel_id)
            .or_default()
            .env_vars
            .insert(variable_name.to_string(), variable_value.to_string());
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel_id);
        self.start_task(channel_id, TaskType::Shell, String::new(), session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let command = match exec_command(data) {
            Ok(command) => command,
            Err(e) => {
                warn!("Exec request on channel {:?} refused: {}", channel_id, e);
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        info!("Exec request on channel {:?}: {}", channel_id, command);
        self.start_task(channel_id, TaskType::Shell, command, session)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        info!("Subsystem request on channel {:?}: {}", channel_id, name);
        self.start_task(channel_id, subsystem_task(name), String::new(), session)
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        // Never waits: the session loop must keep draining task output.
        if let Some(stdin) = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.stdin.as_ref())
        {
            if stdin.send(data.to_vec()).is_err() {
                debug!("Task input closed on channel {:?}", channel_id);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        // Dropping the sender signals EOF to the task.
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        self.channels.remove(&channel_id);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        info!(
            "Direct-tcpip request: {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );

        let Some(proxy) = self.proxy.clone() else {
            return Ok(false);
        };
        let Ok(port) = u16::try_from(port_to_connect) else {
            warn!("Invalid destination port {}", port_to_connect);
            return Ok(false);
        };
        let destination = HostPort {
            host: host_to_connect.to_string(),
            port,
        };

        match proxy.is_forwarding_allowed(&destination) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Port forwarding to {} denied by policy", destination);
                return Ok(false);
            }
            Err(e) => {
                warn!("Port forwarding check failed: {}", e);
                return Ok(false);
            }
        }

        let mut upstream = match proxy.open_destination_connection(&destination).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot open connection to {}: {}", destination, e);
                return Ok(false);
            }
        };

        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
                debug!("Forwarded connection to {} ended: {}", destination, e);
            }
        });
        Ok(true)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            match proxy.dispose() {
                Ok(torn_down) => debug!(session = %proxy.session_id(), torn_down, "Session disposed"),
                Err(e) => warn!(session = %proxy.session_id(), "Failed to dispose session: {}", e),
            }
        }
    }
}

/// Build one repository per configured flow.
pub fn build_repositories(
    config: &GatewayConfig,
    connector: Arc<dyn crate::upstream::Connector>,
) -> Result<Vec<Repository>, Error> {
    config
        .flows
        .iter()
        .map(|flow| Repository::for_flow(flow, connector.clone()))
        .collect()
}

/// Run the SSH server.
pub async fn run_server(server_state: Arc<ServerState>) -> Result<()> {
    let config = server_state.config.clone();
    let key = load_or_generate_host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::Password][..]),
        keys: vec![key],
        ..Default::default()
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let server_state = server_state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(server_state, peer_addr);
            match server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        return russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()));
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}
