//! Templated configuration values.
//!
//! A [`Template<T>`] stores an expression and renders it against a
//! [`Context`] to a concrete `T`. Expressions use Handlebars syntax in strict
//! mode, so a reference to a field the context does not carry is an error
//! rather than an empty string.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::LazyLock;

use handlebars::Handlebars;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::context::{Request, Session, Task};

static ENGINE: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut engine = Handlebars::new();
    engine.set_strict_mode(true);
    engine.register_escape_fn(handlebars::no_escape);
    engine
});

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid template {text:?}: {source}")]
    Compile {
        text: String,
        #[source]
        source: handlebars::TemplateError,
    },

    #[error(transparent)]
    Evaluate(#[from] handlebars::RenderError),

    #[error("expected {expected}, got {value:?}")]
    Type {
        expected: &'static str,
        value: String,
    },
}

/// Conversion from rendered text to a typed value.
pub trait Rendered: Sized {
    fn from_rendered(text: String) -> Result<Self, RenderError>;
}

impl Rendered for String {
    fn from_rendered(text: String) -> Result<Self, RenderError> {
        Ok(text)
    }
}

impl Rendered for bool {
    fn from_rendered(text: String) -> Result<Self, RenderError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" | "" => Ok(false),
            _ => Err(RenderError::Type {
                expected: "a boolean",
                value: text,
            }),
        }
    }
}

/// An immutable templated value of type `T`.
pub struct Template<T> {
    source: String,
    _type: PhantomData<fn() -> T>,
}

impl<T: Rendered> Template<T> {
    /// Parse `source`; fails if the expression does not compile.
    pub fn new(source: impl Into<String>) -> Result<Self, RenderError> {
        let source = source.into();
        if is_expression(&source) {
            handlebars::Template::compile(&source).map_err(|e| RenderError::Compile {
                text: source.clone(),
                source: e,
            })?;
        }
        Ok(Self {
            source,
            _type: PhantomData,
        })
    }

    pub fn render(&self, context: &Context) -> Result<T, RenderError> {
        let text = if is_expression(&self.source) {
            ENGINE.render_template(&self.source, context)?
        } else {
            self.source.clone()
        };
        T::from_rendered(text)
    }
}

impl<T> Template<T> {
    /// A value rendered verbatim. Only for sources known to hold no expression.
    pub(crate) fn literal(source: &str) -> Self {
        Self {
            source: source.to_string(),
            _type: PhantomData,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template renders to an empty value in every context.
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

impl Template<bool> {
    pub fn of(value: bool) -> Self {
        Self::literal(if value { "true" } else { "false" })
    }
}

fn is_expression(source: &str) -> bool {
    source.contains("{{")
}

impl<T> Clone for Template<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> PartialEq for Template<T> {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<T> Eq for Template<T> {}

impl<T> fmt::Debug for Template<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template({:?})", self.source)
    }
}

impl<T> Serialize for Template<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de, T: Rendered> Deserialize<'de> for Template<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Plain TOML scalars (`login_allowed = false`, `port = 2222`) are accepted
        // alongside template strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
            Text(String),
        }

        let source = match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => b.to_string(),
            Raw::Int(i) => i.to_string(),
            Raw::Text(s) => s,
        };
        Template::new(source).map_err(de::Error::custom)
    }
}

/// A list of templated strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Templates(Vec<Template<String>>);

impl Templates {
    pub fn new(items: Vec<Template<String>>) -> Self {
        Self(items)
    }

    pub fn render(&self, context: &Context) -> Result<Vec<String>, RenderError> {
        self.0.iter().map(|t| t.render(context)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Data a template can reference.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization: Option<AuthorizationContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection: Option<ConnectionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<TaskContext>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserContext>,
    flow: String,
    env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
struct UserContext {
    name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionContext {
    id: String,
    flow: String,
    user: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionContext {
    remote: RemoteContext,
}

#[derive(Debug, Clone, Serialize)]
struct RemoteContext {
    address: String,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    #[serde(rename = "type")]
    kind: String,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pty: Option<PtyContext>,
}

#[derive(Debug, Clone, Serialize)]
struct PtyContext {
    term: String,
    cols: u32,
    rows: u32,
}

impl SessionContext {
    fn of(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            flow: session.flow.to_string(),
            user: session.user.clone(),
            created_at: session.created_at.to_rfc3339(),
        }
    }
}

impl Context {
    pub fn from_request(request: &Request) -> Self {
        let authorization = &request.authorization;
        Self {
            authorization: Some(AuthorizationContext {
                user: Some(UserContext {
                    name: authorization.user.clone(),
                }),
                flow: authorization.flow.to_string(),
                env_vars: authorization.env_vars.clone(),
            }),
            session: authorization.session.as_deref().map(SessionContext::of),
            connection: request.remote_addr.map(|addr| ConnectionContext {
                remote: RemoteContext {
                    address: addr.to_string(),
                    host: addr.ip().to_string(),
                    port: addr.port(),
                },
            }),
            task: None,
        }
    }

    pub fn from_task(task: &Task) -> Self {
        let mut context = Self::from_request(&task.request);
        context.task = Some(TaskContext {
            kind: task.kind.to_string(),
            command: task.raw_command.clone(),
            pty: task.pty.as_ref().map(|pty| PtyContext {
                term: pty.term.clone(),
                cols: pty.cols,
                rows: pty.rows,
            }),
        });
        context
    }

    /// Context synthesized from a session alone: the authorization part only
    /// knows the flow, and there is no connection or task data.
    pub fn from_session(session: &Session) -> Self {
        Self {
            authorization: Some(AuthorizationContext {
                user: None,
                flow: session.flow.to_string(),
                env_vars: BTreeMap::new(),
            }),
            session: Some(SessionContext::of(session)),
            connection: None,
            task: None,
        }
    }
}
