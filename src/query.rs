//! # Query Targets
//!
//! The queue never evaluates document queries. It only needs to know which
//! documents a query *could* return, so that it can hand back every batch that
//! might affect the result. [`Query`] therefore carries just the target:
//! a single document, the direct children of a collection, or every
//! collection with a given id (a collection group) below some parent path.
//! Field filters, ordering and limits belong to the query engine.

use crate::error::{Error, Result};
use crate::types::{DocumentKey, ResourcePath};

/// The target of a document query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
}

impl Query {
    /// Query over `path`: a document query if `path` names a document,
    /// otherwise a query over the collection at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
        }
    }

    /// Parses `path` and builds a query over it.
    pub fn parse(path: &str) -> Result<Self> {
        Ok(Self::at_path(ResourcePath::parse(path)?))
    }

    /// Query over every collection named `collection_id` below `parent`.
    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Result<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(Error::InvalidPath {
                path: collection_id,
                reason: "collection group ids must be a single non-empty segment",
            });
        }
        Ok(Self {
            path: parent,
            collection_group: Some(collection_id),
        })
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    /// True if the query targets exactly one document.
    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none() && DocumentKey::is_document_key(&self.path)
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Whether a document at `key` lies within the query's target.
    ///
    /// This is a path-only test: it may accept documents the full query would
    /// filter out, but never rejects one the query could return.
    pub fn matches_key(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        match &self.collection_group {
            Some(group) => key.collection_id() == group && self.path.is_prefix_of(doc_path),
            None if self.is_document_query() => doc_path == &self.path,
            None => doc_path.len() == self.path.len() + 1 && self.path.is_prefix_of(doc_path),
        }
    }
}
