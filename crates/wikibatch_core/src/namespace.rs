use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::reply::Reply;

pub type NamespaceId = i32;

pub const NS_MAIN: NamespaceId = 0;
pub const NS_FILE: NamespaceId = 6;
pub const NS_TEMPLATE: NamespaceId = 10;
pub const NS_CATEGORY: NamespaceId = 14;

/// Bidirectional namespace id/name map for one wiki.
///
/// Built once from site metadata and never mutated; a session against a
/// different wiki builds its own table.
#[derive(Debug, Clone)]
pub struct NamespaceTable {
    names: BTreeMap<NamespaceId, String>,
    ids: HashMap<String, NamespaceId>,
    prefix: Option<Regex>,
}

impl NamespaceTable {
    /// Build from a `meta=siteinfo&siprop=namespaces|namespacealiases` reply.
    pub fn from_reply(reply: &Reply) -> ApiResult<Self> {
        let namespaces = reply
            .at("/query/namespaces")
            .ok_or_else(|| ApiError::Decode("siteinfo reply has no namespaces".to_string()))?;

        let mut entries = Vec::new();
        for entry in object_or_array_values(namespaces) {
            let Some(id) = entry
                .get("id")
                .and_then(Value::as_i64)
                .and_then(|id| NamespaceId::try_from(id).ok())
            else {
                continue;
            };
            let name = entry
                .get("name")
                .or_else(|| entry.get("*"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let canonical = entry.get("canonical").and_then(Value::as_str);
            entries.push((id, name.to_string(), canonical.map(ToString::to_string)));
        }

        let mut aliases = Vec::new();
        for alias in reply.items_at("/query/namespacealiases") {
            let id = alias
                .get("id")
                .and_then(Value::as_i64)
                .and_then(|id| NamespaceId::try_from(id).ok());
            let name = alias
                .get("alias")
                .or_else(|| alias.get("*"))
                .and_then(Value::as_str);
            if let (Some(id), Some(name)) = (id, name) {
                aliases.push((name.to_string(), id));
            }
        }

        Self::build(entries, aliases)
    }

    pub fn from_entries(
        namespaces: &[(NamespaceId, &str)],
        aliases: &[(&str, NamespaceId)],
    ) -> ApiResult<Self> {
        Self::build(
            namespaces
                .iter()
                .map(|(id, name)| (*id, (*name).to_string(), None))
                .collect(),
            aliases
                .iter()
                .map(|(name, id)| ((*name).to_string(), *id))
                .collect(),
        )
    }

    fn build(
        entries: Vec<(NamespaceId, String, Option<String>)>,
        aliases: Vec<(String, NamespaceId)>,
    ) -> ApiResult<Self> {
        let mut names = BTreeMap::new();
        let mut ids = HashMap::new();
        for (id, name, canonical) in entries {
            if !name.is_empty() {
                ids.insert(lookup_key(&name), id);
            }
            if let Some(canonical) = canonical.filter(|value| !value.is_empty()) {
                ids.entry(lookup_key(&canonical)).or_insert(id);
            }
            names.insert(id, name.replace('_', " "));
        }
        for (alias, id) in aliases {
            if !alias.is_empty() {
                ids.entry(lookup_key(&alias)).or_insert(id);
            }
        }

        // Longest names first: the regex alternation is leftmost-first.
        let mut keys = ids.keys().cloned().collect::<Vec<_>>();
        keys.sort_by(|left, right| right.len().cmp(&left.len()).then(left.cmp(right)));
        let prefix = if keys.is_empty() {
            None
        } else {
            let alternation = keys
                .iter()
                .map(|key| regex::escape(key).replace(' ', "[ _]"))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = Regex::new(&format!("(?i)^({alternation})[ _]*:")).map_err(|error| {
                ApiError::Decode(format!("namespace prefix pattern does not compile: {error}"))
            })?;
            Some(pattern)
        };

        Ok(Self { names, ids, prefix })
    }

    pub fn name_of(&self, id: NamespaceId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<NamespaceId> {
        if name.trim().is_empty() {
            return Some(NS_MAIN);
        }
        self.ids.get(&lookup_key(name)).copied()
    }

    /// Namespaces in id order, with their local names.
    pub fn iter(&self) -> impl Iterator<Item = (NamespaceId, &str)> + '_ {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Byte offset just past the namespace prefix and its colon.
    fn prefix_match(&self, title: &str) -> Option<(NamespaceId, usize)> {
        let captures = self.prefix.as_ref()?.captures(title)?;
        let name = captures.get(1)?.as_str();
        let end = captures.get(0)?.end();
        let id = self.ids.get(&lookup_key(name))?;
        Some((*id, end))
    }

    /// Namespace of `title`; titles without a known prefix are in Main.
    pub fn which_namespace(&self, title: &str) -> NamespaceId {
        self.prefix_match(title)
            .map(|(id, _)| id)
            .unwrap_or(NS_MAIN)
    }

    /// Remove a known namespace prefix. Titles without one, or whose colon is
    /// the final character, are returned unchanged.
    pub fn strip_namespace<'a>(&self, title: &'a str) -> &'a str {
        match self.prefix_match(title) {
            Some((_, end)) if end < title.len() => {
                title[end..].trim_start_matches(&[' ', '_'][..])
            }
            _ => title,
        }
    }

    /// `title` if it already lives in `namespace`, otherwise the stripped
    /// title re-prefixed with the namespace's name.
    pub fn convert_if_not_in_namespace(&self, title: &str, namespace: NamespaceId) -> String {
        if self.which_namespace(title) == namespace {
            return title.to_string();
        }
        let stripped = self.strip_namespace(title);
        match self.name_of(namespace) {
            _ if namespace == NS_MAIN => stripped.to_string(),
            Some(name) if !name.is_empty() => format!("{name}:{stripped}"),
            _ => title.to_string(),
        }
    }
}

fn lookup_key(name: &str) -> String {
    name.trim().replace('_', " ").to_lowercase()
}

fn object_or_array_values(value: &Value) -> Vec<&Value> {
    match value {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    }
}
