//! Read-side helpers: list queries driven by [`ContinuationQuery`] and
//! per-title property lookups driven by [`BatchQuery`].
//!
//! [`ContinuationQuery`]: crate::query::ContinuationQuery

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::batch::{BatchQuery, ResultMap};
use crate::error::QueryTemplateError;
use crate::namespace::{NS_CATEGORY, NS_MAIN, NamespaceId};
use crate::query::QueryTemplate;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchHit {
    pub title: String,
    #[serde(default)]
    pub ns: NamespaceId,
    pub pageid: Option<i64>,
    pub wordcount: Option<u64>,
    #[serde(default)]
    pub snippet: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Revision {
    pub revid: i64,
    #[serde(default)]
    pub parentid: Option<i64>,
    pub timestamp: Option<String>,
    pub user: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageRevisions {
    #[serde(default)]
    revisions: Vec<RevisionWithContent>,
}

#[derive(Debug, Deserialize)]
struct RevisionWithContent {
    slots: Option<Slots>,
}

#[derive(Debug, Deserialize)]
struct Slots {
    main: Option<SlotContent>,
}

#[derive(Debug, Deserialize)]
struct SlotContent {
    content: Option<String>,
}

fn namespace_list(namespaces: &[NamespaceId]) -> String {
    namespaces
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

fn decode<T: DeserializeOwned>(value: &Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}

fn titles_of(items: Vec<Value>) -> Vec<String> {
    items
        .iter()
        .filter_map(decode::<TitleItem>)
        .map(|item| item.title)
        .collect()
}

fn overlay(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn list_titles(
    session: &Session,
    template: &QueryTemplate,
    overlay: &[(String, String)],
    cap: Option<usize>,
) -> Result<Vec<String>, QueryTemplateError> {
    let mut query = session.query(&[template], overlay)?;
    if let Some(cap) = cap {
        query = query.with_cap(cap);
    }
    Ok(titles_of(query.collect_items()))
}

fn all_pages_template() -> QueryTemplate {
    QueryTemplate::new("/query/allpages", &[("action", "query"), ("list", "allpages")])
        .limit("aplimit")
        .require("apnamespace")
}

/// Every title in `namespace`, in server order.
pub fn all_pages(
    session: &Session,
    namespace: NamespaceId,
    cap: Option<usize>,
) -> Result<Vec<String>, QueryTemplateError> {
    list_titles(
        session,
        &all_pages_template(),
        &overlay(&[("apnamespace", namespace.to_string())]),
        cap,
    )
}

/// Titles starting with `prefix`. A namespace prefix selects the namespace
/// searched.
pub fn prefix_index(
    session: &Session,
    prefix: &str,
    cap: Option<usize>,
) -> Result<Vec<String>, QueryTemplateError> {
    let namespaces = session.namespaces();
    let namespace = namespaces.which_namespace(prefix);
    let stripped = namespaces.strip_namespace(prefix);
    let mut pairs = vec![("apnamespace", namespace.to_string())];
    // A bare "Template:" lists the whole namespace.
    let bare_namespace = namespace != NS_MAIN && stripped == prefix;
    if !bare_namespace && !stripped.is_empty() {
        pairs.push(("apprefix", stripped.to_string()));
    }
    list_titles(session, &all_pages_template(), &overlay(&pairs), cap)
}

/// Members of `category`; the `Category:` prefix is optional.
pub fn category_members(
    session: &Session,
    category: &str,
    cap: Option<usize>,
) -> Result<Vec<String>, QueryTemplateError> {
    let template = QueryTemplate::new(
        "/query/categorymembers",
        &[("action", "query"), ("list", "categorymembers")],
    )
    .limit("cmlimit")
    .require("cmtitle");
    let title = session
        .namespaces()
        .convert_if_not_in_namespace(category, NS_CATEGORY);
    list_titles(session, &template, &overlay(&[("cmtitle", title)]), cap)
}

pub fn search(
    session: &Session,
    text: &str,
    namespaces: &[NamespaceId],
    cap: Option<usize>,
) -> Result<Vec<SearchHit>, QueryTemplateError> {
    let template = QueryTemplate::new(
        "/query/search",
        &[("action", "query"), ("list", "search"), ("srnamespace", "0")],
    )
    .limit("srlimit")
    .require("srsearch");
    let mut pairs = vec![("srsearch", text.to_string())];
    if !namespaces.is_empty() {
        pairs.push(("srnamespace", namespace_list(namespaces)));
    }
    let mut query = session.query(&[&template], &overlay(&pairs))?;
    if let Some(cap) = cap {
        query = query.with_cap(cap);
    }
    Ok(query.collect_items().iter().filter_map(decode).collect())
}

fn pages_template(params: &[(&str, &str)]) -> QueryTemplate {
    QueryTemplate::new("/query/pages", params).require("titles")
}

/// Current wikitext of each page; `None` for missing pages.
pub fn page_texts(
    session: &Session,
    titles: &[String],
) -> Result<ResultMap<Option<String>>, QueryTemplateError> {
    let template = pages_template(&[
        ("action", "query"),
        ("prop", "revisions"),
        ("rvprop", "content"),
        ("rvslots", "main"),
    ])
    .via_post();
    BatchQuery::new(session, template)?.query(titles, |text: &mut Option<String>, page| {
        let content = decode::<PageRevisions>(page)
            .and_then(|page| page.revisions.into_iter().next())
            .and_then(|revision| revision.slots)
            .and_then(|slots| slots.main)
            .and_then(|main| main.content);
        if content.is_some() {
            *text = content;
        }
    })
}

/// Whether each title names an existing page.
pub fn exists(session: &Session, titles: &[String]) -> Result<ResultMap<bool>, QueryTemplateError> {
    let template = pages_template(&[("action", "query"), ("prop", "info")]);
    BatchQuery::new(session, template)?.query(titles, |exists: &mut bool, page| {
        *exists = page.get("missing").is_none() && page.get("invalid").is_none();
    })
}

fn linked_titles(
    session: &Session,
    titles: &[String],
    prop: &str,
    limit: &str,
    key: &str,
) -> Result<ResultMap<Vec<String>>, QueryTemplateError> {
    let template = pages_template(&[("action", "query"), ("prop", prop)]).sub_limit(limit);
    BatchQuery::new(session, template)?.query(titles, |found: &mut Vec<String>, page| {
        if let Some(items) = page.get(key).and_then(Value::as_array) {
            found.extend(
                items
                    .iter()
                    .filter_map(decode::<TitleItem>)
                    .map(|item| item.title),
            );
        }
    })
}

/// Outgoing wiki links of each page.
pub fn page_links(
    session: &Session,
    titles: &[String],
) -> Result<ResultMap<Vec<String>>, QueryTemplateError> {
    linked_titles(session, titles, "links", "pllimit", "links")
}

pub fn page_categories(
    session: &Session,
    titles: &[String],
) -> Result<ResultMap<Vec<String>>, QueryTemplateError> {
    linked_titles(session, titles, "categories", "cllimit", "categories")
}

/// Templates transcluded by each page.
pub fn page_templates(
    session: &Session,
    titles: &[String],
) -> Result<ResultMap<Vec<String>>, QueryTemplateError> {
    linked_titles(session, titles, "templates", "tllimit", "templates")
}

pub fn last_revisions(
    session: &Session,
    titles: &[String],
) -> Result<ResultMap<Option<Revision>>, QueryTemplateError> {
    let template = pages_template(&[
        ("action", "query"),
        ("prop", "revisions"),
        ("rvprop", "ids|timestamp|user|comment"),
    ]);
    BatchQuery::new(session, template)?.query(titles, |latest: &mut Option<Revision>, page| {
        let revision = page
            .get("revisions")
            .and_then(Value::as_array)
            .and_then(|revisions| revisions.first())
            .and_then(decode::<Revision>);
        if revision.is_some() {
            *latest = revision;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::mock::{self, MockTransport, PagedSource};

    #[test]
    fn all_pages_drains_every_page() {
        let transport = Arc::new(MockTransport::paged(PagedSource::new(
            "allpages",
            "apcontinue",
            "aplimit",
            23,
            10,
        )));
        let session = mock::session(transport.clone());
        let titles = all_pages(&session, 4, None).expect("all pages");
        assert_eq!(titles.len(), 23);
        assert_eq!(titles[0], "Page 0000");
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].param("apnamespace"), Some("4"));
    }

    #[test]
    fn all_pages_honours_cap() {
        let transport = Arc::new(MockTransport::paged(PagedSource::new(
            "allpages",
            "apcontinue",
            "aplimit",
            500,
            10,
        )));
        let session = mock::session(transport);
        let titles = all_pages(&session, 0, Some(15)).expect("all pages");
        assert_eq!(titles.len(), 15);
    }

    #[test]
    fn category_members_adds_the_namespace_prefix_once() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"categorymembers": [{"title": "Sparrow"}, {"title": "Robin"}]}}))
        }));
        let session = mock::session(transport.clone());
        let members = category_members(&session, "Birds", None).expect("members");
        assert_eq!(members, vec!["Sparrow", "Robin"]);
        category_members(&session, "category:Birds", None).expect("members");

        let calls = transport.calls();
        assert_eq!(calls[0].param("cmtitle"), Some("Category:Birds"));
        assert_eq!(calls[1].param("cmtitle"), Some("category:Birds"));
        assert_eq!(calls[0].param("cmlimit"), Some("max"));
    }

    #[test]
    fn prefix_index_splits_namespace_from_prefix() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"allpages": [{"title": "Template:Infobox bird"}]}}))
        }));
        let session = mock::session(transport.clone());
        let titles = prefix_index(&session, "Template:Infobox", None).expect("prefix");
        assert_eq!(titles, vec!["Template:Infobox bird"]);
        let call = &transport.calls()[0];
        assert_eq!(call.param("apnamespace"), Some("10"));
        assert_eq!(call.param("apprefix"), Some("Infobox"));
    }

    #[test]
    fn bare_namespace_prefix_lists_the_whole_namespace() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"allpages": [{"title": "Template:Cite"}]}}))
        }));
        let session = mock::session(transport.clone());
        let titles = prefix_index(&session, "Template:", None).expect("prefix");
        assert_eq!(titles, vec!["Template:Cite"]);
        let call = &transport.calls()[0];
        assert_eq!(call.param("apnamespace"), Some("10"));
        assert_eq!(call.param("apprefix"), None);
    }

    #[test]
    fn search_decodes_hits_and_namespaces() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"search": [
                {"ns": 0, "title": "Owl", "pageid": 3, "wordcount": 120, "snippet": "night", "timestamp": "2024-01-01T00:00:00Z"}
            ]}}))
        }));
        let session = mock::session(transport.clone());
        let hits = search(&session, "owl", &[0, 14], Some(5)).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Owl");
        assert_eq!(hits[0].wordcount, Some(120));
        let call = &transport.calls()[0];
        assert_eq!(call.param("srnamespace"), Some("0|14"));
        assert_eq!(call.param("srlimit"), Some("5"));
    }

    #[test]
    fn page_texts_reads_main_slot_and_keeps_missing_pages() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"pages": [
                {"title": "Alpha", "revisions": [{"slots": {"main": {"content": "alpha text"}}}]},
                {"title": "Ghost", "missing": true}
            ]}}))
        }));
        let session = mock::session(transport.clone());
        let titles = vec!["Alpha".to_string(), "Ghost".to_string(), "Unreturned".to_string()];
        let texts = page_texts(&session, &titles).expect("texts");
        assert_eq!(texts["Alpha"].as_deref(), Some("alpha text"));
        assert_eq!(texts["Ghost"], None);
        assert_eq!(texts["Unreturned"], None);
        assert_eq!(transport.calls()[0].method, mock::Method::Post);
    }

    #[test]
    fn exists_reports_missing_and_invalid_titles() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {
                "normalized": [{"from": "alpha", "to": "Alpha"}],
                "pages": [
                    {"title": "Alpha", "pageid": 1},
                    {"title": "Ghost", "missing": true},
                    {"title": "Bad|", "invalid": true}
                ]
            }}))
        }));
        let session = mock::session(transport);
        let titles = vec!["alpha".to_string(), "Ghost".to_string(), "Bad|".to_string()];
        let found = exists(&session, &titles).expect("exists");
        assert!(found["alpha"]);
        assert!(found["Alpha"]);
        assert!(!found["Ghost"]);
        assert!(!found["Bad|"]);
    }

    #[test]
    fn page_categories_and_templates_collect_titles() {
        let transport = Arc::new(MockTransport::new(|call| {
            let body = match call.param("prop") {
                Some("categories") => json!({"query": {"pages": [
                    {"title": "Owl", "categories": [{"ns": 14, "title": "Category:Birds"}]}
                ]}}),
                _ => json!({"query": {"pages": [
                    {"title": "Owl", "templates": [{"ns": 10, "title": "Template:Taxobox"}]}
                ]}}),
            };
            Ok(body)
        }));
        let session = mock::session(transport.clone());
        let titles = vec!["Owl".to_string()];
        assert_eq!(
            page_categories(&session, &titles).expect("categories")["Owl"],
            vec!["Category:Birds"]
        );
        assert_eq!(
            page_templates(&session, &titles).expect("templates")["Owl"],
            vec!["Template:Taxobox"]
        );
        assert_eq!(transport.calls()[1].param("tllimit"), Some("max"));
    }

    #[test]
    fn page_links_follow_prop_continuation() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Ok(json!({
                "continue": {"plcontinue": "1|0|M", "continue": "||"},
                "query": {"pages": [{"title": "Owl", "links": [{"ns": 0, "title": "Feather"}]}]}
            })),
            Ok(json!({"query": {"pages": [{"title": "Owl", "links": [{"ns": 0, "title": "Mouse"}]}]}})),
        ]));
        let session = mock::session(transport);
        let links = page_links(&session, &["Owl".to_string()]).expect("links");
        assert_eq!(links["Owl"], vec!["Feather", "Mouse"]);
    }

    #[test]
    fn last_revisions_decodes_revision_metadata() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json!({"query": {"pages": [
                {"title": "Owl", "revisions": [{"revid": 42, "parentid": 41, "user": "Bot", "timestamp": "2024-05-01T10:00:00Z", "comment": "tidy"}]}
            ]}}))
        }));
        let session = mock::session(transport);
        let titles = vec!["Owl".to_string(), "Ghost".to_string()];
        let revisions = last_revisions(&session, &titles).expect("revisions");
        let owl = revisions["Owl"].as_ref().expect("revision");
        assert_eq!(owl.revid, 42);
        assert_eq!(owl.user.as_deref(), Some("Bot"));
        assert_eq!(revisions["Ghost"], None);
    }
}
