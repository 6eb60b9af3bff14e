use serde_json::Value;
use std::fmt;

use crate::Fields;

/// Slash separated path of a collection, e.g. `rooms/4821/candidates`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn root(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{}", self.0, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slash separated path of a document, e.g. `rooms/4821/state/ptt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

impl DocPath {
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, name))
    }

    /// The collection holding this document.
    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((_, id)) => id,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Equality filtered view over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    collection: CollectionPath,
    filters: Vec<(String, Value)>,
}

impl Query {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
        }
    }

    /// Only keep documents whose `field` equals `value`.
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_paths() {
        let room = CollectionPath::root("rooms").doc("4821");
        let ptt = room.collection("state").doc("ptt");
        assert_eq!(ptt.as_str(), "rooms/4821/state/ptt");
        assert_eq!(ptt.id(), "ptt");
        assert_eq!(ptt.parent().as_str(), "rooms/4821/state");
    }

    #[test]
    fn query_filters_by_equality() {
        let query = Query::new(CollectionPath::root("signals"))
            .where_eq("from", "a")
            .where_eq("type", "offer");

        let matching = json!({"from": "a", "type": "offer", "sdp": "x"});
        let other = json!({"from": "a", "type": "answer"});
        assert!(query.matches(matching.as_object().unwrap()));
        assert!(!query.matches(other.as_object().unwrap()));
    }
}
