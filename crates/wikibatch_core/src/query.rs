//! Continuation-driven queries.
//!
//! A [`QueryTemplate`] describes the shape of a query: default parameters,
//! required placeholders, the per-request limit parameter and where the
//! reply keeps its items. A [`ContinuationQuery`] drives one logical query
//! over as many round-trips as the server's `continue` object asks for, or
//! until a caller-supplied item cap is met.

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DEFAULT_LIMIT_MAX;
use crate::error::{ApiError, QueryTemplateError};
use crate::reply::Reply;
use crate::transport::{Params, Transport, get_param, set_param};

/// Value the server accepts as "its own maximum" for any limit parameter.
pub const LIMIT_MAX: &str = "max";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    params: Vec<(String, Option<String>)>,
    limit_param: Option<String>,
    limit_counts_items: bool,
    items_path: String,
    use_post: bool,
}

impl QueryTemplate {
    pub fn new(items_path: &str, params: &[(&str, &str)]) -> Self {
        Self {
            params: params
                .iter()
                .map(|(key, value)| ((*key).to_string(), Some((*value).to_string())))
                .collect(),
            limit_param: None,
            limit_counts_items: true,
            items_path: items_path.to_string(),
            use_post: false,
        }
    }

    /// Declare the per-request limit parameter; it defaults to the server maximum.
    pub fn limit(mut self, name: &str) -> Self {
        self.limit_param = Some(name.to_string());
        self.limit_counts_items = true;
        self
    }

    /// Declare a limit that counts entries nested inside each item, such as
    /// `pllimit` under `/query/pages`. A cap never shrinks it.
    pub fn sub_limit(mut self, name: &str) -> Self {
        self.limit_param = Some(name.to_string());
        self.limit_counts_items = false;
        self
    }

    /// Declare a parameter the caller must supply through the overlay.
    pub fn require(mut self, name: &str) -> Self {
        match self.params.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = None,
            None => self.params.push((name.to_string(), None)),
        }
        self
    }

    /// Send the query as a form POST, for parameter sets too long for a URL.
    pub fn via_post(mut self) -> Self {
        self.use_post = true;
        self
    }

    pub fn items_path(&self) -> &str {
        &self.items_path
    }

    pub fn limit_param(&self) -> Option<&str> {
        self.limit_param.as_deref()
    }

    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|(key, _)| key == name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.params
            .iter()
            .any(|(key, value)| key == name && value.is_none())
    }
}

/// One continuation sequence against the API.
///
/// `has()` stays true while another round-trip is legal; `next()` performs
/// it. Transport and protocol errors end the sequence: `next()` returns
/// `None` and the failure is kept in [`ContinuationQuery::last_error`].
pub struct ContinuationQuery<'a> {
    transport: &'a dyn Transport,
    params: Params,
    limit_param: Option<String>,
    shrink_limit: bool,
    limit_override: Option<usize>,
    limit_max: usize,
    items_path: String,
    use_post: bool,
    can_continue: bool,
    count: usize,
    cap: Option<usize>,
    round_trips: usize,
    last_error: Option<ApiError>,
}

impl<'a> ContinuationQuery<'a> {
    /// Merge `templates` in order, then `overlay`. Fails fast if any required
    /// placeholder is still unset.
    pub fn new(
        transport: &'a dyn Transport,
        templates: &[&QueryTemplate],
        overlay: &[(String, String)],
    ) -> Result<Self, QueryTemplateError> {
        let mut merged: Vec<(String, Option<String>)> = Vec::new();
        for template in templates {
            for (key, value) in &template.params {
                match merged.iter_mut().find(|(existing, _)| existing == key) {
                    Some(entry) => {
                        if value.is_some() || entry.1.is_none() {
                            entry.1 = value.clone();
                        }
                    }
                    None => merged.push((key.clone(), value.clone())),
                }
            }
        }
        for (key, value) in overlay {
            match merged.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = Some(value.clone()),
                None => merged.push((key.clone(), Some(value.clone()))),
            }
        }

        let mut params = Params::with_capacity(merged.len() + 1);
        for (key, value) in merged {
            match value {
                Some(value) => params.push((key, value)),
                None => return Err(QueryTemplateError::UnsetParameter(key)),
            }
        }

        let limit_owner = templates
            .iter()
            .find(|template| template.limit_param.is_some());
        let limit_param = limit_owner.and_then(|template| template.limit_param.clone());
        let shrink_limit = limit_owner.is_some_and(|template| template.limit_counts_items);
        let mut limit_override = None;
        if let Some(name) = &limit_param {
            match get_param(&params, name) {
                Some(value) if value != LIMIT_MAX => limit_override = value.parse::<usize>().ok(),
                Some(_) => {}
                None => set_param(&mut params, name, LIMIT_MAX),
            }
        }

        let first = templates.first();
        Ok(Self {
            transport,
            params,
            limit_param,
            shrink_limit,
            limit_override,
            limit_max: DEFAULT_LIMIT_MAX,
            items_path: first
                .map(|template| template.items_path.clone())
                .unwrap_or_default(),
            use_post: templates.iter().any(|template| template.use_post),
            can_continue: true,
            count: 0,
            cap: None,
            round_trips: 0,
            last_error: None,
        })
    }

    /// Stop once `cap` items have been returned in total.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        if cap == 0 {
            self.can_continue = false;
        }
        self
    }

    /// Largest numeric limit the server grants per request.
    pub fn with_limit_max(mut self, limit_max: usize) -> Self {
        self.limit_max = limit_max.max(1);
        self
    }

    pub fn has(&self) -> bool {
        self.can_continue && !self.cap_reached()
    }

    fn cap_reached(&self) -> bool {
        self.cap.is_some_and(|cap| self.count >= cap)
    }

    /// Perform one round-trip and prepare the next one.
    pub fn next(&mut self) -> Option<Reply> {
        if !self.has() {
            return None;
        }
        self.shrink_limit_for_cap();

        self.round_trips += 1;
        debug!(
            round_trip = self.round_trips,
            items_so_far = self.count,
            "continuation query round-trip"
        );
        let outcome = if self.use_post {
            self.transport.post(&self.params)
        } else {
            self.transport.get(&self.params)
        };

        let reply = match outcome.and_then(Reply::into_result) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(error = %error, round_trip = self.round_trips, "continuation query terminated");
                self.last_error = Some(error);
                self.can_continue = false;
                return None;
            }
        };

        self.count += reply.items_at(&self.items_path).len();
        match reply.continuation() {
            Some(pairs) => {
                for (key, value) in pairs {
                    set_param(&mut self.params, &key, value);
                }
            }
            None => self.can_continue = false,
        }
        if self.cap_reached() {
            self.can_continue = false;
        }
        Some(reply)
    }

    fn shrink_limit_for_cap(&mut self) {
        let (Some(cap), Some(name)) = (self.cap, self.limit_param.as_deref()) else {
            return;
        };
        if !self.shrink_limit {
            return;
        }
        let remaining = cap.saturating_sub(self.count);
        let per_request = self.limit_override.unwrap_or(self.limit_max);
        if remaining < per_request {
            set_param(&mut self.params, name, remaining.to_string());
        }
    }

    /// Drive the sequence to completion, handing each reply to `visit`.
    pub fn drain<F>(&mut self, mut visit: F)
    where
        F: FnMut(&Reply),
    {
        while self.has() {
            match self.next() {
                Some(reply) => visit(&reply),
                None => break,
            }
        }
    }

    /// Drive the sequence to completion and return every item found at the
    /// template's items path, never more than the cap.
    pub fn collect_items(mut self) -> Vec<Value> {
        let path = self.items_path.clone();
        let mut items = Vec::new();
        self.drain(|reply| items.extend(reply.items_at(&path).into_iter().cloned()));
        if let Some(cap) = self.cap {
            items.truncate(cap);
        }
        items
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    pub fn items_path(&self) -> &str {
        &self.items_path
    }
}
