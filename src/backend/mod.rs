//! Backend registry.
//!
//! A flow's `backend.type` tag selects a constructor from [`REGISTRY`] once, at
//! flow setup. The resulting [`Repository`] gates and builds per-session
//! [`Proxy`] values.

pub mod remote;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{BackendConfig, FlowConfig};
use crate::context::{FlowName, HostPort, PtyRequest, Request, Session, SessionId, Task};
use crate::error::Error;
use crate::upstream::Connector;

use self::remote::{RemoteProxy, RemoteRepository};

/// Builds the repository of one flow.
pub type Constructor =
    fn(FlowName, &BackendConfig, Arc<dyn Connector>) -> Result<Repository, Error>;

/// Backend type tag to constructor.
pub const REGISTRY: &[(&str, Constructor)] = &[("remote", remote::construct)];

pub fn constructor(tag: &str) -> Option<Constructor> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, ctor)| *ctor)
}

/// Byte stream to a port forwarding destination.
pub trait DestinationStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DestinationStream for T {}

/// Per-flow gate and proxy factory.
#[derive(Clone)]
pub enum Repository {
    Remote(Arc<RemoteRepository>),
}

impl Repository {
    pub fn for_flow(flow: &FlowConfig, connector: Arc<dyn Connector>) -> Result<Self, Error> {
        let tag = flow.backend.tag();
        let ctor = constructor(tag).ok_or_else(|| {
            Error::System(format!("no backend registered for type '{tag}'"))
        })?;
        ctor(flow.name.clone(), &flow.backend, connector)
    }

    pub fn flow(&self) -> &FlowName {
        match self {
            Self::Remote(r) => r.flow(),
        }
    }

    pub fn acceptance_check(&self, request: &Request) -> Result<bool, Error> {
        match self {
            Self::Remote(r) => r.acceptance_check(request),
        }
    }

    pub fn supports_pty(&self, pty: &PtyRequest) -> bool {
        match self {
            Self::Remote(r) => r.supports_pty(pty),
        }
    }

    pub fn construct_for_session(&self, request: &Request) -> Result<Proxy, Error> {
        match self {
            Self::Remote(r) => r.construct_for_session(request).map(Proxy::Remote),
        }
    }

    pub fn proxy_for_session(&self, session: Arc<Session>) -> Proxy {
        match self {
            Self::Remote(r) => Proxy::Remote(r.proxy_for_session(session)),
        }
    }

    pub fn release(&self) -> Result<(), Error> {
        match self {
            Self::Remote(r) => r.release(),
        }
    }

    pub fn cleanup(&self) -> Result<(), Error> {
        match self {
            Self::Remote(r) => r.cleanup(),
        }
    }
}

/// Per-session object that runs tasks against a backend.
pub enum Proxy {
    Remote(RemoteProxy),
}

impl Proxy {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Remote(p) => p.session_id(),
        }
    }

    pub fn banner(&self, request: &Request) -> Result<String, Error> {
        match self {
            Self::Remote(p) => p.banner(request),
        }
    }

    /// Run one task to completion and return the remote exit status.
    pub async fn run_task(&self, task: Task) -> Result<u32, Error> {
        match self {
            Self::Remote(p) => p.run_task(task).await,
        }
    }

    pub fn is_forwarding_allowed(&self, destination: &HostPort) -> Result<bool, Error> {
        match self {
            Self::Remote(p) => p.is_forwarding_allowed(destination),
        }
    }

    pub async fn open_destination_connection(
        &self,
        destination: &HostPort,
    ) -> Result<Box<dyn DestinationStream>, Error> {
        match self {
            Self::Remote(p) => p.open_destination_connection(destination).await,
        }
    }

    /// Returns whether the backend was torn down for good.
    pub fn dispose(&self) -> Result<bool, Error> {
        match self {
            Self::Remote(p) => p.dispose(),
        }
    }

    pub fn release(&self) -> Result<(), Error> {
        match self {
            Self::Remote(p) => p.release(),
        }
    }
}
