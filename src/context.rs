//! Request, session and task context handed to backends.
//!
//! The inbound side builds these; backends only read them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Name of a flow (routing policy) from the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowName(String);

impl FlowName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An authenticated principal bound to a flow for the lifetime of a connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub flow: FlowName,
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(flow: FlowName, user: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: SessionId::new(),
            flow,
            user: user.into(),
            remote_addr,
            created_at: Utc::now(),
        }
    }
}

/// Result of the inbound authentication step.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub user: String,
    pub flow: FlowName,
    /// Set once the gateway has established a session for this principal.
    pub session: Option<Arc<Session>>,
    /// Environment variables the client sent (`env` requests).
    pub env_vars: BTreeMap<String, String>,
}

impl Authorization {
    pub fn new(user: impl Into<String>, flow: FlowName) -> Self {
        Self {
            user: user.into(),
            flow,
            session: None,
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn find_session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub authorization: Authorization,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(authorization: Authorization, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            authorization,
            remote_addr,
        }
    }
}

/// Terminal requested by the client (name and geometry only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    /// Interactive shell, or a one-shot command when the raw command is set.
    Shell,
    Sftp,
    /// Any other subsystem the client asked for.
    Subsystem(String),
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => f.write_str("shell"),
            Self::Sftp => f.write_str("sftp"),
            Self::Subsystem(name) => write!(f, "subsystem:{name}"),
        }
    }
}

pub type TaskReader = Box<dyn AsyncRead + Send + Unpin>;
pub type TaskWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound streams of a task.
pub struct TaskIo {
    pub stdin: TaskReader,
    pub stdout: TaskWriter,
    pub stderr: TaskWriter,
}

impl TaskIo {
    pub fn new(stdin: TaskReader, stdout: TaskWriter, stderr: TaskWriter) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }
}

impl fmt::Debug for TaskIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskIo")
    }
}

/// One shell/exec/sftp invocation within a session.
#[derive(Debug)]
pub struct Task {
    pub request: Request,
    pub kind: TaskType,
    pub pty: Option<PtyRequest>,
    /// Command line sent with an exec request; empty for interactive shells.
    pub raw_command: String,
    pub io: TaskIo,
}

/// Destination of a port forwarding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
