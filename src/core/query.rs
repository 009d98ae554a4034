use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::target::Target;
use crate::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::value::{compare_values, type_order, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let field_value = document_field(doc, &self.field);
        let Some(other) = field_value.as_ref() else {
            return false;
        };

        match self.operator {
            FilterOperator::NotEqual => compare_values(other, &self.value) != Ordering::Equal,
            FilterOperator::ArrayContains => other
                .as_array()
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => needles.values().iter().any(|needle| array.contains(needle)),
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .map(|values| values.values().iter().any(|needle| values_equal(needle, other)))
                .unwrap_or(false),
            FilterOperator::NotIn => match self.value.as_array() {
                Some(values) => {
                    !values.contains(&FirestoreValue::null())
                        && !matches!(other.kind(), ValueKind::Null)
                        && !values.contains(other)
                }
                None => false,
            },
            op => {
                if type_order(other) != type_order(&self.value) {
                    return false;
                }
                let ordering = compare_values(other, &self.value);
                match op {
                    FilterOperator::LessThan => ordering == Ordering::Less,
                    FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                    FilterOperator::Equal => ordering == Ordering::Equal,
                    FilterOperator::GreaterThan => ordering == Ordering::Greater,
                    FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                    _ => false,
                }
            }
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let l = left.field(&self.field).unwrap_or(&null);
            let r = right.field(&self.field).unwrap_or(&null);
            compare_values(l, r)
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), dir)
    }
}

/// Cursor position expressed as values for the leading order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_document_id() {
                match component.kind() {
                    ValueKind::Reference(path) => ResourcePath::from_string(path)
                        .map(|p| p.cmp(doc.key().path()))
                        .unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                compare_values(component, doc.field(&order.field).unwrap_or(&null))
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// For a start cursor: whether the document is at or after the bound.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// For an end cursor: whether the document is at or before the bound.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let mut id = String::from(if self.inclusive { "b:" } else { "a:" });
        for value in &self.position {
            id.push_str(&canonical_value(value));
        }
        id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query over a collection, a collection group or a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection or the single document at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn filter(mut self, field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        self.filters.push(FieldFilter::new(field, operator, value));
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    /// Re-roots a collection group query at one concrete collection.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none() && DocumentKey::is_document_key(&self.path) && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when every document under the path matches, in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_document_id()))
    }

    fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.operator.is_inequality())
            .map(|filter| &filter.field)
    }

    /// Explicit ordering plus the implied inequality field and trailing key ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.inequality_field() {
                if !field.is_document_id() {
                    order_by.push(OrderBy::new(field.clone(), Direction::Ascending));
                }
            }
        }
        if !order_by.iter().any(|order| order.field.is_document_id()) {
            let direction = order_by
                .last()
                .map(|order| order.direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found_document()
            && self.matches_path_and_collection_group(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    pub fn matches_path_and_collection_group(&self, key: &DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => key.collection_group() == group && self.path.is_prefix_of(key.path()),
            None if DocumentKey::is_document_key(&self.path) => &self.path == key.path(),
            None => self.path.is_immediate_parent_of(key.path()),
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .filter(|order| !order.field.is_document_id())
            .all(|order| doc.field(&order.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Total order of matching documents as the query returns them.
    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn comparator(&self) -> impl Fn(&Document, &Document) -> Ordering + Send + Sync + 'static {
        let order_by = self.normalized_order_by();
        move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
    }

    /// Backend target for this query; limit-to-last queries run reversed.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let flipped = order_by
                    .into_iter()
                    .map(|order| {
                        let direction = match order.direction {
                            Direction::Ascending => Direction::Descending,
                            Direction::Descending => Direction::Ascending,
                        };
                        OrderBy::new(order.field, direction)
                    })
                    .collect();
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    self.end_at.clone(),
                    self.start_at.clone(),
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

pub(crate) fn canonical_filters(filters: &[FieldFilter]) -> String {
    filters.iter().map(FieldFilter::canonical_id).collect::<Vec<_>>().join(",")
}

pub(crate) fn canonical_order_by(order_by: &[OrderBy]) -> String {
    order_by.iter().map(OrderBy::canonical_id).collect::<Vec<_>>().join(",")
}

pub(crate) fn canonical_bound(bound: &Bound) -> String {
    bound.canonical_id()
}

fn document_field(doc: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(doc.key().path().canonical_string()));
    }
    doc.field(field).cloned()
}

fn canonical_value(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical_value(value, &mut out);
    out
}

fn write_canonical_value(value: &FirestoreValue, out: &mut String) {
    let _ = match value.kind() {
        ValueKind::Null => write!(out, "null"),
        ValueKind::Boolean(v) => write!(out, "{v}"),
        ValueKind::Integer(v) => write!(out, "{v}"),
        ValueKind::Double(v) => write!(out, "{v:?}"),
        ValueKind::Timestamp(ts) => write!(out, "time({},{})", ts.seconds, ts.nanos),
        ValueKind::String(s) => write!(out, "{s}"),
        ValueKind::Bytes(b) => write!(out, "{}", b.to_base64()),
        ValueKind::Reference(path) => write!(out, "{path}"),
        ValueKind::GeoPoint(p) => write!(out, "geo({},{})", p.latitude(), p.longitude()),
        ValueKind::Array(array) => {
            out.push('[');
            for (i, item) in array.values().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_value(item, out);
            }
            write!(out, "]")
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (i, (key, item)) in map.fields().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical_value(item, out);
            }
            write!(out, "}}")
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SnapshotVersion;
    use crate::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        Document::found(DocumentKey::from_string(path).unwrap(), SnapshotVersion::min(), data)
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn matches_immediate_children_only() {
        let query = rooms();
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!query.matches(&doc("other/a", &[])));
        assert!(query.matches_all_documents());
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(query.matches(&doc("messages/2", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn document_query_matches_exact_key() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let query = Query::for_document(&key);
        assert!(query.is_document_query());
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/b", &[])));
    }

    #[test]
    fn filters_require_matching_types() {
        let query = rooms().filter(field("n"), FilterOperator::GreaterThan, 1.into());
        assert!(query.matches(&doc("rooms/a", &[("n", 2.into())])));
        assert!(!query.matches(&doc("rooms/b", &[("n", "3".into())])));
        assert!(!query.matches(&doc("rooms/c", &[])));
    }

    #[test]
    fn not_equal_and_not_in_skip_missing_and_null() {
        let ne = rooms().filter(field("n"), FilterOperator::NotEqual, 1.into());
        assert!(ne.matches(&doc("rooms/a", &[("n", "x".into())])));
        assert!(!ne.matches(&doc("rooms/b", &[])));

        let not_in = rooms().filter(
            field("n"),
            FilterOperator::NotIn,
            FirestoreValue::from_array(vec![1.into(), 2.into()]),
        );
        assert!(not_in.matches(&doc("rooms/a", &[("n", 3.into())])));
        assert!(!not_in.matches(&doc("rooms/b", &[("n", FirestoreValue::null())])));
        assert!(!not_in.matches(&doc("rooms/c", &[("n", 2.into())])));
    }

    #[test]
    fn array_filters() {
        let tags = FirestoreValue::from_array(vec!["a".into(), "b".into()]);
        let contains = rooms().filter(field("tags"), FilterOperator::ArrayContains, "b".into());
        assert!(contains.matches(&doc("rooms/a", &[("tags", tags.clone())])));
        let any = rooms().filter(
            field("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "a".into()]),
        );
        assert!(any.matches(&doc("rooms/a", &[("tags", tags)])));
        let in_query = rooms().filter(
            field("n"),
            FilterOperator::In,
            FirestoreValue::from_array(vec![1.into(), 5.into()]),
        );
        assert!(in_query.matches(&doc("rooms/a", &[("n", 5.into())])));
    }

    #[test]
    fn inequality_implies_ordering() {
        let query = rooms().filter(field("n"), FilterOperator::LessThan, 10.into());
        let order: Vec<String> = query
            .normalized_order_by()
            .iter()
            .map(|o| o.field().canonical_string())
            .collect();
        assert_eq!(order, vec!["n".to_string(), "__name__".to_string()]);
    }

    #[test]
    fn orders_by_field_then_key() {
        let query = rooms().order_by(field("n"), Direction::Descending);
        let a = doc("rooms/a", &[("n", 1.into())]);
        let b = doc("rooms/b", &[("n", 2.into())]);
        let c = doc("rooms/c", &[("n", 2.into())]);
        assert_eq!(query.compare_documents(&b, &a), Ordering::Less);
        assert_eq!(query.compare_documents(&c, &b), Ordering::Less);
        assert!(!query.matches(&doc("rooms/d", &[])));
    }

    #[test]
    fn bounds_limit_results() {
        let query = rooms()
            .order_by(field("n"), Direction::Ascending)
            .start_at(Bound::new(vec![2.into()], true))
            .end_at(Bound::new(vec![4.into()], false));
        assert!(!query.matches(&doc("rooms/a", &[("n", 1.into())])));
        assert!(query.matches(&doc("rooms/b", &[("n", 2.into())])));
        assert!(query.matches(&doc("rooms/c", &[("n", 3.into())])));
        assert!(!query.matches(&doc("rooms/d", &[("n", 4.into())])));
    }

    #[test]
    fn canonical_ids_distinguish_limit_type() {
        let first = rooms().order_by(field("n"), Direction::Ascending).limit_to_first(2);
        let last = rooms().order_by(field("n"), Direction::Descending).limit_to_last(2);
        assert_ne!(first.canonical_id(), last.canonical_id());
        assert_eq!(first.to_target(), last.to_target());
    }
}
