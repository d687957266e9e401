//! Per-attempt resolvers for proxy, user agent, headers, and auth
//!
//! A resolver is an async function `(url, method, body) -> value | absent`.
//! All configured resolvers run concurrently, fresh on every attempt, so
//! rotating pools may hand out a different value each time.

use crate::crawler::task::Headers;
use crate::HarvestError;
use async_trait::async_trait;
use reqwest::Method;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Which resolver produced a value or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    Proxy,
    UserAgent,
    Headers,
    Auth,
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverKind::Proxy => write!(f, "proxy"),
            ResolverKind::UserAgent => write!(f, "user-agent"),
            ResolverKind::Headers => write!(f, "headers"),
            ResolverKind::Auth => write!(f, "auth"),
        }
    }
}

/// Input handed to every resolver
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<String>,
}

/// Basic-auth credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: Option<String>,
}

impl Auth {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

pub type ResolveResult<T> = Result<Option<T>, anyhow::Error>;

/// Supplies one value per request attempt
///
/// Any `Fn(ResolveRequest) -> impl Future<Output = ResolveResult<T>>` closure
/// is a resolver.
#[async_trait]
pub trait Resolver<T>: Send + Sync {
    async fn resolve(&self, request: &ResolveRequest) -> ResolveResult<T>;
}

#[async_trait]
impl<T, F, Fut> Resolver<T> for F
where
    T: Send + 'static,
    F: Fn(ResolveRequest) -> Fut + Send + Sync,
    Fut: Future<Output = ResolveResult<T>> + Send,
{
    async fn resolve(&self, request: &ResolveRequest) -> ResolveResult<T> {
        (self)(request.clone()).await
    }
}

/// A resolver that always yields the same value
pub fn static_value<T>(value: T) -> impl Resolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    move |_request: ResolveRequest| {
        let value = value.clone();
        async move { Ok::<_, anyhow::Error>(Some(value)) }
    }
}

/// Values produced by one round of resolution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<Headers>,
    pub auth: Option<Auth>,
}

/// The optional resolvers of a crawler
#[derive(Clone, Default)]
pub struct Resolvers {
    pub proxy: Option<Arc<dyn Resolver<String>>>,
    pub user_agent: Option<Arc<dyn Resolver<String>>>,
    pub headers: Option<Arc<dyn Resolver<Headers>>>,
    pub auth: Option<Arc<dyn Resolver<Auth>>>,
}

impl Resolvers {
    /// Runs every configured resolver concurrently
    ///
    /// Returns once all have completed, or with the first failure.
    pub async fn resolve_all(&self, request: &ResolveRequest) -> Result<Resolved, HarvestError> {
        let (proxy, user_agent, headers, auth) = tokio::try_join!(
            resolve_one(self.proxy.as_deref(), ResolverKind::Proxy, request),
            resolve_one(self.user_agent.as_deref(), ResolverKind::UserAgent, request),
            resolve_one(self.headers.as_deref(), ResolverKind::Headers, request),
            resolve_one(self.auth.as_deref(), ResolverKind::Auth, request),
        )?;

        Ok(Resolved {
            proxy,
            user_agent,
            headers,
            auth,
        })
    }
}

impl fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolvers")
            .field("proxy", &self.proxy.is_some())
            .field("user_agent", &self.user_agent.is_some())
            .field("headers", &self.headers.is_some())
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

async fn resolve_one<T>(
    resolver: Option<&dyn Resolver<T>>,
    kind: ResolverKind,
    request: &ResolveRequest,
) -> Result<Option<T>, HarvestError> {
    let Some(resolver) = resolver else {
        return Ok(None);
    };

    resolver
        .resolve(request)
        .await
        .map_err(|e| HarvestError::Resolver {
            url: request.url.clone(),
            kind,
            message: e.to_string(),
        })
}
