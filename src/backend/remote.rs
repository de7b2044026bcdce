//! The `remote` backend: relays each task to an upstream SSH server.
//!
//! Connection parameters come from templated configuration rendered against
//! the live task, so one flow can fan out to different hosts and accounts.

use std::sync::Arc;

use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, RemoteConfig};
use crate::context::{FlowName, HostPort, PtyRequest, Request, Session, SessionId, Task, TaskType};
use crate::error::Error;
use crate::relay::relay;
use crate::template::{Context, RenderError};
use crate::upstream::{Connector, Target, UpstreamChannel, UpstreamConnection};

use super::{DestinationStream, Repository};

/// Command executed upstream for sftp tasks.
pub const SFTP_SERVER_COMMAND: &str = "sftp-server";

pub(super) fn construct(
    flow: FlowName,
    config: &BackendConfig,
    connector: Arc<dyn Connector>,
) -> Result<Repository, Error> {
    let BackendConfig::Remote(conf) = config;
    Ok(Repository::Remote(Arc::new(RemoteRepository::new(
        flow,
        Arc::new(conf.clone()),
        connector,
    ))))
}

pub struct RemoteRepository {
    flow: FlowName,
    conf: Arc<RemoteConfig>,
    connector: Arc<dyn Connector>,
}

impl RemoteRepository {
    pub fn new(flow: FlowName, conf: Arc<RemoteConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            flow,
            conf,
            connector,
        }
    }

    pub fn flow(&self) -> &FlowName {
        &self.flow
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.conf
    }

    /// Whether the principal of `request` may log in through this backend.
    pub fn acceptance_check(&self, request: &Request) -> Result<bool, Error> {
        self.conf
            .login_allowed
            .render(&Context::from_request(request))
            .map_err(|e| Error::render("login_allowed", e))
    }

    pub fn supports_pty(&self, _pty: &PtyRequest) -> bool {
        true
    }

    /// Check acceptance again and build a proxy for the request's session.
    pub fn construct_for_session(self: &Arc<Self>, request: &Request) -> Result<RemoteProxy, Error> {
        if !self.acceptance_check(request)? {
            return Err(Error::NotAcceptable);
        }

        let session = request
            .authorization
            .find_session()
            .ok_or_else(|| Error::System("authorization without session".to_string()))?;

        Ok(self.proxy_for_session(session.clone()))
    }

    /// A new proxy on every call; proxies are never shared or cached.
    pub fn proxy_for_session(self: &Arc<Self>, session: Arc<Session>) -> RemoteProxy {
        debug!(flow = %self.flow, session = %session.id, "creating remote proxy");
        RemoteProxy {
            repository: Arc::clone(self),
            session,
        }
    }

    pub fn release(&self) -> Result<(), Error> {
        Ok(())
    }

    pub fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct RemoteProxy {
    repository: Arc<RemoteRepository>,
    session: Arc<Session>,
}

impl RemoteProxy {
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// This backend holds no per-session key material.
    pub fn public_key(&self) -> Option<PublicKey> {
        None
    }

    pub fn banner(&self, request: &Request) -> Result<String, Error> {
        self.repository
            .conf
            .banner
            .render(&Context::from_request(request))
            .map_err(|e| Error::render("banner", e))
    }

    /// Relay one task to the upstream host.
    ///
    /// Returns the remote exit status; a non-zero status is not an error.
    /// The upstream channel and connection are closed on every path.
    pub async fn run_task(&self, mut task: Task) -> Result<u32, Error> {
        let target = self.resolve_target(&Context::from_task(&task))?;

        info!(
            session = %self.session.id,
            flow = %self.repository.flow,
            task = %task.kind,
            target_addr = %target.address(),
            "relaying task to remote server"
        );

        let mut connection = self.repository.connector.connect(&target).await?;
        let result = self.run_on_connection(connection.as_mut(), &mut task).await;
        connection.close().await;

        match &result {
            Ok(status) => debug!(session = %self.session.id, status, "remote task finished"),
            Err(e) => warn!(session = %self.session.id, "remote task failed: {}", e),
        }
        result
    }

    fn resolve_target(&self, context: &Context) -> Result<Target, Error> {
        let conf = &self.repository.conf;
        let host = conf
            .host
            .render(context)
            .map_err(|e| Error::render("host", e))?;
        let port = conf
            .port
            .render(context)
            .map_err(|e| Error::render("port", e))?;
        let port = port.trim().parse::<u16>().map_err(|_| {
            Error::render(
                "port",
                RenderError::Type {
                    expected: "a port number",
                    value: port.clone(),
                },
            )
        })?;
        let user = conf
            .user
            .render(context)
            .map_err(|e| Error::render("user", e))?;
        let password = conf
            .password
            .render(context)
            .map_err(|e| Error::render("password", e))?;

        Ok(Target {
            host,
            port,
            user,
            password,
        })
    }

    async fn run_on_connection(
        &self,
        connection: &mut dyn UpstreamConnection,
        task: &mut Task,
    ) -> Result<u32, Error> {
        let mut channel = connection.open_session().await?;
        let result = self.run_in_channel(channel.as_mut(), task).await;
        channel.close().await;
        result
    }

    async fn run_in_channel(
        &self,
        channel: &mut dyn UpstreamChannel,
        task: &mut Task,
    ) -> Result<u32, Error> {
        if let Some(pty) = &task.pty {
            channel.request_pty(pty).await?;
        }

        // Exec requests arrive as shell tasks carrying the command line.
        let command = match &task.kind {
            TaskType::Shell if task.raw_command.is_empty() => None,
            TaskType::Shell => Some(task.raw_command.clone()),
            TaskType::Sftp => Some(SFTP_SERVER_COMMAND.to_string()),
            other => return Err(Error::UnsupportedTask(other.to_string())),
        };

        match &command {
            Some(command) => {
                debug!(session = %self.session.id, command = %command, "executing remote command");
                channel.exec(command).await?;
            }
            None => channel.shell().await?,
        }

        let completion = relay(channel, &mut task.io).await?;
        completion.exit_status().ok_or_else(|| {
            Error::transport(
                "SSH session failed",
                "remote side closed the channel without an exit status",
            )
        })
    }

    /// Render the forwarding policy. Only session data is available here, no
    /// user name, connection or task fields.
    pub fn is_forwarding_allowed(&self, destination: &HostPort) -> Result<bool, Error> {
        let allowed = self
            .repository
            .conf
            .port_forwarding_allowed
            .render(&Context::from_session(&self.session))
            .map_err(|e| Error::render("port_forwarding_allowed", e))?;
        debug!(session = %self.session.id, destination = %destination, allowed, "port forwarding check");
        Ok(allowed)
    }

    pub async fn open_destination_connection(
        &self,
        _destination: &HostPort,
    ) -> Result<Box<dyn DestinationStream>, Error> {
        Err(Error::Permission(
            "port forwarding not implemented for remote environment".to_string(),
        ))
    }

    pub fn dispose(&self) -> Result<bool, Error> {
        Ok(false)
    }

    pub fn release(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{request, session, task, task_io};
    use crate::context::Authorization;
    use crate::error::{exit_code_of, ErrorKind};
    use crate::template::Template;
    use crate::upstream::testing::{Call, ScriptedConnector};
    use crate::upstream::UpstreamEvent;
    use tokio::io::AsyncReadExt;

    fn conf() -> RemoteConfig {
        let mut conf = RemoteConfig::with_host(Template::new("db.internal").unwrap());
        conf.password = Template::new("pw-{{authorization.user.name}}").unwrap();
        conf
    }

    fn repository(conf: RemoteConfig, connector: Arc<ScriptedConnector>) -> Arc<RemoteRepository> {
        Arc::new(RemoteRepository::new(
            FlowName::new("default"),
            Arc::new(conf),
            connector,
        ))
    }

    fn expected_target(user: &str) -> Target {
        Target {
            host: "db.internal".into(),
            port: 22,
            user: user.into(),
            password: format!("pw-{user}"),
        }
    }

    #[test]
    fn test_acceptance_check_follows_login_allowed() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.login_allowed =
            Template::new(r#"{{#if (eq authorization.user.name "root")}}false{{else}}true{{/if}}"#)
                .unwrap();
        let repo = repository(c, connector);

        assert!(repo.acceptance_check(&request(&session("alice"))).unwrap());
        assert!(!repo.acceptance_check(&request(&session("root"))).unwrap());
    }

    #[test]
    fn test_acceptance_render_failure_is_an_error() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.login_allowed = Template::new("{{authorization.envVars.MISSING}}").unwrap();
        let repo = repository(c, connector);

        let err = repo.acceptance_check(&request(&session("alice"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
        assert!(err.to_string().contains("login_allowed"));
    }

    #[test]
    fn test_supports_any_pty() {
        let repo = repository(conf(), Arc::new(ScriptedConnector::exiting(0)));
        let pty = PtyRequest {
            term: "vt100".into(),
            cols: 1,
            rows: 1,
        };
        assert!(repo.supports_pty(&pty));
    }

    #[test]
    fn test_construct_rejected_when_not_acceptable() {
        let mut c = conf();
        c.login_allowed = Template::of(false);
        let repo = repository(c, Arc::new(ScriptedConnector::exiting(0)));

        let err = repo
            .construct_for_session(&request(&session("alice")))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotAcceptable);
    }

    #[test]
    fn test_construct_requires_session() {
        let repo = repository(conf(), Arc::new(ScriptedConnector::exiting(0)));
        let req = Request::new(
            Authorization::new("alice", FlowName::new("default")),
            None,
        );

        let err = repo.construct_for_session(&req).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[tokio::test]
    async fn test_two_constructions_are_independent() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");

        let a = repo.construct_for_session(&request(&sess)).unwrap();
        let b = repo.construct_for_session(&request(&sess)).unwrap();
        assert_eq!(a.session_id(), b.session_id());

        assert!(!a.dispose().unwrap());
        assert!(a.release().is_ok());
        drop(a);

        let (t, _pipes) = task(&sess, TaskType::Shell, "true");
        assert_eq!(b.run_task(t).await.unwrap(), 0);
        assert!(!b.dispose().unwrap());
    }

    #[tokio::test]
    async fn test_interactive_shell() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.construct_for_session(&request(&sess)).unwrap();

        let (t, _pipes) = task(&sess, TaskType::Shell, "");
        assert_eq!(proxy.run_task(t).await.unwrap(), 0);
        assert_eq!(
            connector.log.control_calls(),
            vec![
                Call::Connect(expected_target("alice")),
                Call::OpenSession,
                Call::Shell,
                Call::CloseChannel,
                Call::CloseConnection,
            ]
        );
    }

    #[tokio::test]
    async fn test_shell_with_command_runs_it() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            UpstreamEvent::Data(b"total 0\n".to_vec()),
            UpstreamEvent::ExitStatus(0),
            UpstreamEvent::Close,
        ]));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, mut pipes) = task(&sess, TaskType::Shell, "ls -la");
        assert_eq!(proxy.run_task(t).await.unwrap(), 0);
        assert!(connector.log.calls().contains(&Call::Exec("ls -la".into())));
        assert!(!connector.log.calls().contains(&Call::Shell));

        let mut out = String::new();
        pipes.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "total 0\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_success() {
        let connector = Arc::new(ScriptedConnector::exiting(42));
        let repo = repository(conf(), connector);
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "exit 42");
        let result = proxy.run_task(t).await;
        assert_eq!(result.as_ref().unwrap(), &42);
        assert_eq!(exit_code_of(&result), 42);
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_an_error() {
        let connector = Arc::new(ScriptedConnector::new(vec![UpstreamEvent::Close]));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "ls");
        let result = proxy.run_task(t).await;
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(exit_code_of(&result), -1);
        assert_eq!(
            connector.log.control_calls().last(),
            Some(&Call::CloseConnection)
        );
    }

    #[tokio::test]
    async fn test_sftp_ignores_configured_command() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.sftp_command = crate::template::Templates::new(vec![
            Template::new("/usr/lib/openssh/sftp-server").unwrap(),
        ]);
        let repo = repository(c, connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Sftp, "");
        assert_eq!(proxy.run_task(t).await.unwrap(), 0);
        assert!(
            connector
                .log
                .calls()
                .contains(&Call::Exec(SFTP_SERVER_COMMAND.into()))
        );
    }

    #[tokio::test]
    async fn test_unsupported_task_releases_connection() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Subsystem("x11".into()), "");
        let result = proxy.run_task(t).await;
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Dispatch);
        assert_eq!(exit_code_of(&result), -1);
        assert_eq!(
            connector.log.control_calls(),
            vec![
                Call::Connect(expected_target("alice")),
                Call::OpenSession,
                Call::CloseChannel,
                Call::CloseConnection,
            ]
        );
    }

    #[tokio::test]
    async fn test_pty_forwards_term_and_geometry() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let pty = PtyRequest {
            term: "xterm-256color".into(),
            cols: 120,
            rows: 40,
        };
        let (io, _pipes) = task_io(b"");
        let t = Task {
            request: request(&sess),
            kind: TaskType::Shell,
            pty: Some(pty.clone()),
            raw_command: String::new(),
            io,
        };
        assert_eq!(proxy.run_task(t).await.unwrap(), 0);
        let calls = connector.log.control_calls();
        assert_eq!(calls[2], Call::RequestPty(pty));
        assert_eq!(calls[3], Call::Shell);
    }

    #[tokio::test]
    async fn test_render_failure_prevents_connect() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.host = Template::new("{{authorization.envVars.TARGET}}").unwrap();
        let repo = repository(c, connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "");
        let err = proxy.run_task(t).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
        assert!(err.to_string().contains("host"));
        assert!(connector.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_port_is_a_render_error() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.port = Template::new("ssh").unwrap();
        let repo = repository(c, connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "");
        let err = proxy.run_task(t).await.unwrap_err();
        assert!(matches!(err, Error::Render { field: "port", .. }));
        assert!(connector.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let connector = Arc::new(ScriptedConnector::refusing());
        let repo = repository(conf(), connector);
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "");
        let result = proxy.run_task(t).await;
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(exit_code_of(&result), -1);
    }

    #[tokio::test]
    async fn test_channel_open_failure_still_disconnects() {
        let connector = Arc::new(ScriptedConnector::refusing_channels());
        let repo = repository(conf(), connector.clone());
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        let (t, _pipes) = task(&sess, TaskType::Shell, "ls");
        let result = proxy.run_task(t).await;
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(exit_code_of(&result), -1);
        assert_eq!(
            connector.log.control_calls(),
            vec![
                Call::Connect(expected_target("alice")),
                Call::OpenSession,
                Call::CloseConnection,
            ]
        );
    }

    #[test]
    fn test_forwarding_policy_is_rendered() {
        let connector = Arc::new(ScriptedConnector::exiting(0));
        let mut c = conf();
        c.port_forwarding_allowed =
            Template::new(r#"{{#if (eq authorization.flow "default")}}true{{else}}false{{/if}}"#)
                .unwrap();
        let repo = repository(c, connector.clone());
        let proxy = repo.proxy_for_session(session("alice"));
        let dest = HostPort {
            host: "localhost".into(),
            port: 5432,
        };
        assert!(proxy.is_forwarding_allowed(&dest).unwrap());

        let mut c = conf();
        c.port_forwarding_allowed = Template::of(false);
        let repo = repository(c, connector);
        let proxy = repo.proxy_for_session(session("alice"));
        assert!(!proxy.is_forwarding_allowed(&dest).unwrap());
    }

    #[test]
    fn test_forwarding_policy_has_no_user_name() {
        let mut c = conf();
        c.port_forwarding_allowed = Template::new("{{authorization.user.name}}").unwrap();
        let repo = repository(c, Arc::new(ScriptedConnector::exiting(0)));
        let proxy = repo.proxy_for_session(session("alice"));
        let dest = HostPort {
            host: "localhost".into(),
            port: 80,
        };
        let err = proxy.is_forwarding_allowed(&dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
    }

    #[tokio::test]
    async fn test_destination_connections_are_denied() {
        let repo = repository(conf(), Arc::new(ScriptedConnector::exiting(0)));
        let proxy = repo.proxy_for_session(session("alice"));
        for (host, port) in [("localhost", 80), ("10.1.2.3", 5432), ("::1", 1)] {
            let dest = HostPort {
                host: host.into(),
                port,
            };
            let err = proxy.open_destination_connection(&dest).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Permission);
        }
    }

    #[test]
    fn test_banner_and_lifecycle() {
        let mut c = conf();
        c.banner = Template::new("Welcome {{authorization.user.name}}\n").unwrap();
        let repo = repository(c, Arc::new(ScriptedConnector::exiting(0)));
        let sess = session("alice");
        let proxy = repo.proxy_for_session(sess.clone());

        assert_eq!(proxy.banner(&request(&sess)).unwrap(), "Welcome alice\n");
        assert!(proxy.public_key().is_none());
        assert!(!proxy.dispose().unwrap());
        assert!(proxy.release().is_ok());
        assert!(repo.release().is_ok());
        assert!(repo.cleanup().is_ok());
    }
}
