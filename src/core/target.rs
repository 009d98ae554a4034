use serde::{Deserialize, Serialize};

use crate::core::query::{canonical_bound, canonical_filters, canonical_order_by, Bound, FieldFilter, OrderBy, Query};
use crate::model::{DocumentKey, ResourcePath};

/// Normalized, backend-facing form of a query. Equal targets share one listen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub(crate) fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Target listening to exactly one document, as used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Query::for_document(key).to_target()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// Query that produces this target, used by instances that learn about a
    /// target from shared state instead of from a local listen.
    pub fn to_query(&self) -> Query {
        let mut query = match &self.collection_group {
            Some(group) => Query::collection_group(group.clone()),
            None => Query::at_path(self.path.clone()),
        };
        for filter in &self.filters {
            query = query.filter(filter.field().clone(), filter.operator(), filter.value().clone());
        }
        for order in &self.order_by {
            query = query.order_by(order.field().clone(), order.direction());
        }
        if let Some(limit) = self.limit {
            query = query.limit_to_first(limit);
        }
        if let Some(start) = &self.start_at {
            query = query.start_at(start.clone());
        }
        if let Some(end) = &self.end_at {
            query = query.end_at(end.clone());
        }
        query
    }

    /// Stable string identity used to find an existing target for an equal query.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(&canonical_filters(&self.filters));
        id.push_str("|ob:");
        id.push_str(&canonical_order_by(&self.order_by));
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&canonical_bound(start));
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&canonical_bound(end));
        }
        id
    }
}
