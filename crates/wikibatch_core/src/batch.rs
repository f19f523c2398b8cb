//! Title-batched queries.
//!
//! The server accepts a bounded number of titles per request. [`BatchQuery`]
//! splits any title list into legal groups, drains one continuation query per
//! group and folds every page object into a per-title [`ResultMap`].

use std::collections::{HashMap, HashSet};
use std::slice::Chunks;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::QueryTemplateError;
use crate::query::QueryTemplate;
use crate::session::Session;

/// Per-title results keyed by the title as the server reports it, plus every
/// title the caller asked for.
pub type ResultMap<V> = HashMap<String, V>;

/// Split `titles` into ordered groups of at most `group_size`.
pub fn partition_titles(
    titles: &[String],
    group_size: usize,
) -> Result<Chunks<'_, String>, QueryTemplateError> {
    if group_size == 0 {
        return Err(QueryTemplateError::ZeroGroupSize);
    }
    Ok(titles.chunks(group_size))
}

pub struct BatchQuery<'s> {
    session: &'s Session,
    template: QueryTemplate,
    title_param: String,
    group_size: usize,
    cap: Option<usize>,
}

impl<'s> BatchQuery<'s> {
    /// `template` must declare `titles` as a required placeholder.
    pub fn new(session: &'s Session, template: QueryTemplate) -> Result<Self, QueryTemplateError> {
        Self::with_title_param(session, template, "titles")
    }

    pub fn with_title_param(
        session: &'s Session,
        template: QueryTemplate,
        title_param: &str,
    ) -> Result<Self, QueryTemplateError> {
        if !template.is_required(title_param) {
            return Err(QueryTemplateError::MissingTitleParameter(
                title_param.to_string(),
            ));
        }
        Ok(Self {
            session,
            template,
            title_param: title_param.to_string(),
            group_size: session.settings().group_size,
            cap: None,
        })
    }

    /// Override the group size; it can only shrink below the session's limit.
    pub fn group_size(mut self, group_size: usize) -> Result<Self, QueryTemplateError> {
        if group_size == 0 {
            return Err(QueryTemplateError::ZeroGroupSize);
        }
        self.group_size = group_size.min(self.session.settings().group_size);
        Ok(self)
    }

    /// Cap on distinct pages folded across all groups. Pages past the cap are
    /// dropped; titles past it are still touched.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Run the query for every title and fold each returned page object into
    /// the value stored under its title.
    ///
    /// Every input title gets an entry even when the server returns nothing
    /// for it. Titles the server normalized or followed as redirects resolve
    /// to the same value as their target.
    pub fn query<V, F>(&self, titles: &[String], mut fold: F) -> Result<ResultMap<V>, QueryTemplateError>
    where
        V: Default + Clone,
        F: FnMut(&mut V, &Value),
    {
        let mut results: ResultMap<V> = HashMap::with_capacity(titles.len());
        let mut total = 0usize;

        for (index, batch) in partition_titles(titles, self.group_size)?.enumerate() {
            let remaining = self.cap.map(|cap| cap.saturating_sub(total));
            if remaining == Some(0) {
                touch(&mut results, batch);
                continue;
            }

            let overlay = vec![(self.title_param.clone(), batch.join("|"))];
            let mut query = self.session.query(&[&self.template], &overlay)?;
            let items_path = query.items_path().to_string();

            // A page repeats across round-trips under prop continuation, so
            // the cap counts distinct titles.
            let mut folded: HashSet<String> = HashSet::new();
            let mut redirects = Vec::new();
            let mut normalized = Vec::new();
            query.drain(|reply| {
                for page in reply.items_at(&items_path) {
                    let Some(title) = page.get("title").and_then(Value::as_str) else {
                        continue;
                    };
                    if !folded.contains(title) {
                        if remaining.is_some_and(|remaining| folded.len() >= remaining) {
                            continue;
                        }
                        folded.insert(title.to_string());
                    }
                    fold(results.entry(title.to_string()).or_default(), page);
                }
                redirects.extend(title_pairs(reply.at("/query/redirects")));
                normalized.extend(title_pairs(reply.at("/query/normalized")));
                touch(&mut results, batch);
            });
            total += folded.len();
            if let Some(error) = query.last_error() {
                warn!(batch = index, titles = batch.len(), error = %error, "batch ended early");
            }
            debug!(
                batch = index,
                titles = batch.len(),
                round_trips = query.round_trips(),
                "batch drained"
            );

            touch(&mut results, batch);
            for (from, to) in redirects.into_iter().chain(normalized) {
                if let Some(value) = results.get(&to).cloned() {
                    results.insert(from, value);
                }
            }
        }

        Ok(results)
    }
}

fn touch<V: Default>(results: &mut ResultMap<V>, batch: &[String]) {
    for title in batch {
        results.entry(title.clone()).or_default();
    }
}

fn title_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let from = item.get("from").and_then(Value::as_str)?;
            let to = item.get("to").and_then(Value::as_str)?;
            Some((from.to_string(), to.to_string()))
        })
        .collect()
}
