//! In-process transports for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::error::{ApiError, ApiResult};
use crate::namespace::NamespaceTable;
use crate::reply::Reply;
use crate::session::{RetryPolicy, Session, SessionSettings};
use crate::transport::{Params, Transport, get_param};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Multipart,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub params: Params,
    pub upload: Option<(String, Vec<u8>)>,
}

impl Call {
    pub fn param(&self, key: &str) -> Option<&str> {
        get_param(&self.params, key)
    }

    pub fn action(&self) -> Option<&str> {
        self.param("action")
    }

    pub fn is_token_request(&self) -> bool {
        self.param("meta") == Some("tokens")
    }
}

type Handler = Box<dyn Fn(&Call) -> ApiResult<Value> + Send + Sync>;

pub struct MockTransport {
    handler: Handler,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Call) -> ApiResult<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies handed out in order; an exhausted script is a transport error.
    pub fn scripted(replies: Vec<ApiResult<Value>>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Transport("no scripted reply".to_string())))
        })
    }

    pub fn paged(source: PagedSource) -> Self {
        Self::new(move |call| Ok(source.reply(call)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_with_action(&self, action: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.action() == Some(action) && !call.is_token_request())
            .collect()
    }

    fn record(&self, call: Call) -> ApiResult<Reply> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        (self.handler)(&call).map(Reply::new)
    }
}

impl Transport for MockTransport {
    fn get(&self, params: &[(String, String)]) -> ApiResult<Reply> {
        self.record(Call {
            method: Method::Get,
            params: params.to_vec(),
            upload: None,
        })
    }

    fn post(&self, params: &[(String, String)]) -> ApiResult<Reply> {
        self.record(Call {
            method: Method::Post,
            params: params.to_vec(),
            upload: None,
        })
    }

    fn multipart_post(
        &self,
        params: &[(String, String)],
        filename: &str,
        bytes: Vec<u8>,
    ) -> ApiResult<Reply> {
        self.record(Call {
            method: Method::Multipart,
            params: params.to_vec(),
            upload: Some((filename.to_string(), bytes)),
        })
    }

    fn request_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Synthetic list endpoint with `total` items served `page_size` at a time.
pub struct PagedSource {
    list: String,
    continue_param: String,
    limit_param: String,
    total: usize,
    page_size: usize,
}

impl PagedSource {
    pub fn new(
        list: &str,
        continue_param: &str,
        limit_param: &str,
        total: usize,
        page_size: usize,
    ) -> Self {
        Self {
            list: list.to_string(),
            continue_param: continue_param.to_string(),
            limit_param: limit_param.to_string(),
            total,
            page_size,
        }
    }

    pub fn reply(&self, call: &Call) -> Value {
        let offset = call
            .param(&self.continue_param)
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let limit = match call.param(&self.limit_param) {
            None | Some("max") => self.page_size,
            Some(value) => value
                .parse::<usize>()
                .map(|value| value.min(self.page_size))
                .unwrap_or(self.page_size),
        };
        let end = (offset + limit).min(self.total);
        let items = (offset..end)
            .map(|index| json!({"ns": 0, "title": format!("Page {index:04}")}))
            .collect::<Vec<_>>();

        let mut query = Map::new();
        query.insert(self.list.clone(), Value::Array(items));
        let mut body = Map::new();
        body.insert("query".to_string(), Value::Object(query));
        if end < self.total {
            let mut continuation = Map::new();
            continuation.insert(self.continue_param.clone(), Value::String(end.to_string()));
            continuation.insert("continue".to_string(), Value::String("-||".to_string()));
            body.insert("continue".to_string(), Value::Object(continuation));
        }
        Value::Object(body)
    }
}

pub fn token_reply() -> Value {
    json!({"batchcomplete": true, "query": {"tokens": {"csrftoken": "abc+\\"}}})
}

pub fn siteinfo_reply() -> Value {
    json!({
        "batchcomplete": true,
        "query": {
            "namespaces": {
                "0": {"id": 0, "name": "", "content": true},
                "2": {"id": 2, "name": "User", "canonical": "User"},
                "4": {"id": 4, "name": "Project", "canonical": "Project"},
                "6": {"id": 6, "name": "File", "canonical": "File"},
                "10": {"id": 10, "name": "Template", "canonical": "Template"},
                "14": {"id": 14, "name": "Category", "canonical": "Category"}
            },
            "namespacealiases": [{"id": 6, "alias": "Image"}]
        }
    })
}

pub fn namespaces() -> NamespaceTable {
    NamespaceTable::from_reply(&Reply::new(siteinfo_reply())).expect("namespace table")
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            rate_limit_backoff: Duration::from_millis(1),
        },
        ..SessionSettings::default()
    }
}

pub fn session(transport: Arc<MockTransport>) -> Session {
    Session::with_namespaces(transport, namespaces(), settings())
}

/// Session whose rate-limit backoff is long enough to measure.
pub fn session_with_backoff(transport: Arc<MockTransport>, backoff: Duration) -> Session {
    let mut settings = settings();
    settings.retry.rate_limit_backoff = backoff;
    Session::with_namespaces(transport, namespaces(), settings)
}
