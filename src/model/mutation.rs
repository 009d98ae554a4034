use serde::{Deserialize, Serialize};

use crate::error::{internal_error, FirestoreResult};
use crate::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::value::server_timestamp::pending_server_timestamp;
use crate::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_valid_for(&self, document: Option<&Document>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(true) => document.map(Document::is_found_document).unwrap_or(false),
            Precondition::Exists(false) => document.map(Document::is_no_document).unwrap_or(true),
            Precondition::UpdateTime(version) => document
                .map(|doc| doc.is_found_document() && doc.version() == *version)
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    Increment(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field_path: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => pending_server_timestamp(local_write_time, previous),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::Increment(operand) => numeric_increment(previous, operand),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set(MapValue),
    /// Writes only the fields named in the mask; masked fields absent from the value are deleted.
    Patch { value: MapValue, mask: Vec<FieldPath> },
    Delete,
    /// Checks the precondition without modifying the document.
    Verify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Outcome of one acknowledged mutation as reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set(value), Precondition::None)
    }

    /// Patch that only applies if the document exists, mirroring a field update.
    pub fn patch(key: DocumentKey, value: MapValue, mask: Vec<FieldPath>) -> Self {
        Self::new(key, MutationKind::Patch { value, mask }, Precondition::Exists(true))
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None)
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(key, MutationKind::Verify, Precondition::UpdateTime(version))
    }

    fn new(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Computes the latency-compensated view of the document after this mutation.
    ///
    /// Returns the input unchanged when the precondition does not hold.
    pub fn apply_to_local_view(
        &self,
        document: Option<Document>,
        local_write_time: Timestamp,
    ) -> Option<Document> {
        if !self.precondition.is_valid_for(document.as_ref()) {
            return document;
        }

        let version = post_mutation_version(document.as_ref());
        match &self.kind {
            MutationKind::Set(value) => {
                let mut data = value.clone();
                self.apply_local_transforms(&mut data, document.as_ref(), local_write_time);
                Some(Document::found(self.key.clone(), version, data).with_local_mutations())
            }
            MutationKind::Patch { value, mask } => {
                let mut data = document
                    .as_ref()
                    .and_then(Document::data)
                    .cloned()
                    .unwrap_or_default();
                patch_object(&mut data, value, mask);
                self.apply_local_transforms(&mut data, document.as_ref(), local_write_time);
                Some(Document::found(self.key.clone(), version, data).with_local_mutations())
            }
            MutationKind::Delete => {
                let version = document.as_ref().map_or_else(SnapshotVersion::min, Document::version);
                Some(Document::no_document(self.key.clone(), version).with_local_mutations())
            }
            MutationKind::Verify => document,
        }
    }

    /// Applies the mutation to the cached remote document once the backend acknowledged it.
    ///
    /// Fails when the result does not carry one value per field transform.
    pub fn apply_to_remote_document(
        &self,
        document: Option<Document>,
        result: &MutationResult,
    ) -> FirestoreResult<Option<Document>> {
        let updated = match &self.kind {
            MutationKind::Set(value) => {
                let mut data = value.clone();
                self.apply_server_transforms(&mut data, &result.transform_results)?;
                Some(Document::found(self.key.clone(), result.version, data).with_committed_mutations())
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document.as_ref()) {
                    return Ok(Some(Document::unknown(self.key.clone(), result.version).with_committed_mutations()));
                }
                let mut data = document
                    .as_ref()
                    .and_then(Document::data)
                    .cloned()
                    .unwrap_or_default();
                patch_object(&mut data, value, mask);
                self.apply_server_transforms(&mut data, &result.transform_results)?;
                Some(Document::found(self.key.clone(), result.version, data).with_committed_mutations())
            }
            MutationKind::Delete => {
                Some(Document::no_document(self.key.clone(), result.version).with_committed_mutations())
            }
            MutationKind::Verify => document,
        };
        Ok(updated)
    }

    fn apply_local_transforms(
        &self,
        data: &mut MapValue,
        previous: Option<&Document>,
        local_write_time: Timestamp,
    ) {
        for transform in &self.field_transforms {
            let previous_value = previous.and_then(|doc| doc.field(&transform.field_path));
            let current = previous_value.or_else(|| data.get(&transform.field_path)).cloned();
            let value = transform.apply_to_local_view(current.as_ref(), local_write_time);
            data.set(&transform.field_path, value);
        }
    }

    fn apply_server_transforms(&self, data: &mut MapValue, results: &[FirestoreValue]) -> FirestoreResult<()> {
        if self.field_transforms.len() != results.len() {
            return Err(internal_error(format!(
                "Mutation on {} expected {} transform results, got {}",
                self.key,
                self.field_transforms.len(),
                results.len()
            )));
        }
        for (transform, value) in self.field_transforms.iter().zip(results) {
            data.set(&transform.field_path, value.clone());
        }
        Ok(())
    }
}

fn post_mutation_version(document: Option<&Document>) -> SnapshotVersion {
    match document {
        Some(doc) if doc.is_found_document() => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn patch_object(data: &mut MapValue, value: &MapValue, mask: &[FieldPath]) {
    for path in mask {
        match value.get(path) {
            Some(new_value) => data.set(path, new_value.clone()),
            None => data.delete(path),
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    let filtered: Vec<FirestoreValue> = values
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();

    FirestoreValue::from_array(filtered)
}

// Non-numeric bases count as zero; integer overflow saturates.
fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (None, ValueKind::Integer(delta)) => FirestoreValue::from_integer(*delta),
        (base, delta) => FirestoreValue::from_double(as_double(base) + as_double(Some(delta))),
    }
}

fn as_double(kind: Option<&ValueKind>) -> f64 {
    match kind {
        Some(ValueKind::Integer(value)) => *value as f64,
        Some(ValueKind::Double(value)) => *value,
        _ => 0.0,
    }
}
