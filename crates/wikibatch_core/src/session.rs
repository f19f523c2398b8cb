use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{
    DEFAULT_ACTION_ATTEMPTS, DEFAULT_CHUNK_ATTEMPTS, DEFAULT_CHUNK_SIZE, DEFAULT_GROUP_SIZE,
    DEFAULT_LIMIT_MAX, DEFAULT_RATE_LIMIT_BACKOFF_MS,
};
use crate::error::{ApiError, ApiResult, QueryTemplateError};
use crate::namespace::NamespaceTable;
use crate::query::{ContinuationQuery, QueryTemplate};
use crate::transport::{Transport, params};

/// Retry rules shared by every mutating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ACTION_ATTEMPTS,
            rate_limit_backoff: Duration::from_millis(DEFAULT_RATE_LIMIT_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub group_size: usize,
    pub limit_max: usize,
    pub chunk_size: u64,
    pub chunk_attempts: usize,
    pub retry: RetryPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            limit_max: DEFAULT_LIMIT_MAX,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_attempts: DEFAULT_CHUNK_ATTEMPTS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Authenticated context shared by every component.
///
/// The namespace table is fixed at construction. The CSRF token is cached and
/// refreshed single-flight, so a `Session` can be shared by reference across
/// worker threads.
pub struct Session {
    transport: Arc<dyn Transport>,
    namespaces: NamespaceTable,
    settings: SessionSettings,
    csrf_token: RwLock<Option<String>>,
    token_refresh: Mutex<()>,
}

impl Session {
    /// Fetch site metadata and build the namespace table.
    pub fn open(transport: Arc<dyn Transport>, settings: SessionSettings) -> ApiResult<Self> {
        let reply = transport
            .get(&params(&[
                ("action", "query"),
                ("meta", "siteinfo"),
                ("siprop", "namespaces|namespacealiases"),
            ]))?
            .into_result()?;
        let namespaces = NamespaceTable::from_reply(&reply)?;
        info!(namespaces = namespaces.len(), "opened wiki session");
        Ok(Self::with_namespaces(transport, namespaces, settings))
    }

    pub fn with_namespaces(
        transport: Arc<dyn Transport>,
        namespaces: NamespaceTable,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            namespaces,
            settings,
            csrf_token: RwLock::new(None),
            token_refresh: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn request_count(&self) -> usize {
        self.transport.request_count()
    }

    /// Start a continuation query bounded by this wiki's limit maximum.
    pub fn query(
        &self,
        templates: &[&QueryTemplate],
        overlay: &[(String, String)],
    ) -> Result<ContinuationQuery<'_>, QueryTemplateError> {
        Ok(ContinuationQuery::new(self.transport(), templates, overlay)?
            .with_limit_max(self.settings.limit_max))
    }

    pub fn login(&self, username: &str, password: &str) -> ApiResult<()> {
        let token_reply = self
            .transport
            .get(&params(&[
                ("action", "query"),
                ("meta", "tokens"),
                ("type", "login"),
            ]))?
            .into_result()?;
        let login_token: String = token_reply.decode_at("/query/tokens/logintoken")?;

        let reply = self
            .transport
            .post(&params(&[
                ("action", "login"),
                ("lgname", username),
                ("lgpassword", password),
                ("lgtoken", login_token.as_str()),
            ]))?
            .into_result()?;
        let payload: LoginPayload = reply.decode_at("/login")?;
        match payload.result.as_deref() {
            Some("Success") => {
                *self
                    .csrf_token
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                info!(user = username, "logged in");
                Ok(())
            }
            other => Err(ApiError::Api {
                code: "login-failed".to_string(),
                info: payload
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }

    pub fn csrf_token(&self) -> ApiResult<String> {
        let cached = self
            .csrf_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cached {
            Some(token) => Ok(token),
            None => self.refresh_csrf_token(None),
        }
    }

    /// Replace a token the server rejected. Callers that saw the same stale
    /// token wait on one fetch instead of each issuing their own.
    pub fn refresh_csrf_token(&self, stale: Option<&str>) -> ApiResult<String> {
        let _guard = self
            .token_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self
            .csrf_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(current) = current
            && stale != Some(current.as_str())
        {
            return Ok(current);
        }

        debug!("fetching csrf token");
        let reply = self
            .transport
            .get(&params(&[("action", "query"), ("meta", "tokens")]))?
            .into_result()?;
        let token: String = reply.decode_at("/query/tokens/csrftoken")?;
        *self
            .csrf_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
