//! Field-level mutations and their coalescing rules.

use crate::error::{MooringError, MooringResult};
use mooring_codec::{decode_json, encode_json, encode_pointer, Number, Pointer, RelationRef, Value};
use serde_json::{json, Value as Json};

/// A pending mutation of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOperation {
    /// Replace the field.
    Set(Value),
    /// Remove the field.
    Delete,
    /// Add to a numeric field.
    Increment(Number),
    /// Append to an array field.
    Add(Vec<Value>),
    /// Append to an array field, skipping values already present.
    AddUnique(Vec<Value>),
    /// Remove every occurrence of the values from an array field.
    Remove(Vec<Value>),
    /// Add and remove members of a relation field.
    Relation {
        /// Class of the related objects.
        target_class: String,
        /// Members to add.
        adds: Vec<Pointer>,
        /// Members to remove.
        removes: Vec<Pointer>,
    },
}

impl FieldOperation {
    /// Whether the operation replaces the field outright instead of
    /// composing with its previous value.
    pub fn overwrites(&self) -> bool {
        matches!(self, FieldOperation::Set(_) | FieldOperation::Delete)
    }

    /// Combines this operation with the one queued before it on the same
    /// field, producing a single equivalent operation.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] when the two operations
    /// cannot be composed (e.g. an increment after setting a string).
    pub fn merge_with_previous(&self, previous: &FieldOperation) -> MooringResult<FieldOperation> {
        use FieldOperation as Op;

        match (self, previous) {
            (Op::Set(_) | Op::Delete, _) => Ok(self.clone()),

            (Op::Increment(amount), Op::Delete) => Ok(Op::Set((*amount).into())),
            (Op::Increment(amount), Op::Set(value)) => match value.as_number() {
                Some(base) => Ok(Op::Set(base.add(*amount).into())),
                None => Err(MooringError::illegal_argument(
                    "You cannot increment a non-number.",
                )),
            },
            (Op::Increment(amount), Op::Increment(prior)) => Ok(Op::Increment(prior.add(*amount))),

            (Op::Add(_) | Op::AddUnique(_) | Op::Remove(_), Op::Delete) => {
                self.apply(None, "").map(|v| Op::Set(v.unwrap_or(Value::Null)))
            }
            (Op::Add(_) | Op::AddUnique(_) | Op::Remove(_), Op::Set(value)) => {
                if value.as_array().is_none() {
                    return Err(MooringError::illegal_argument(
                        "You can only modify a list with a list operation.",
                    ));
                }
                self.apply(Some(value), "")
                    .map(|v| Op::Set(v.unwrap_or(Value::Null)))
            }
            (Op::Add(items), Op::Add(prior)) => {
                Ok(Op::Add(prior.iter().chain(items).cloned().collect()))
            }
            (Op::AddUnique(items), Op::AddUnique(prior)) => {
                let mut merged = prior.clone();
                push_unique(&mut merged, items);
                Ok(Op::AddUnique(merged))
            }
            (Op::Remove(items), Op::Remove(prior)) => {
                let mut merged = prior.clone();
                push_unique(&mut merged, items);
                Ok(Op::Remove(merged))
            }

            (
                Op::Relation {
                    target_class,
                    adds,
                    removes,
                },
                Op::Relation {
                    target_class: prior_class,
                    adds: prior_adds,
                    removes: prior_removes,
                },
            ) => {
                if target_class != prior_class {
                    return Err(MooringError::illegal_argument(format!(
                        "Related object must be of class {prior_class}, \
                         but {target_class} was passed in."
                    )));
                }
                let mut merged_adds: Vec<Pointer> = prior_adds
                    .iter()
                    .filter(|p| !removes.contains(p))
                    .cloned()
                    .collect();
                for p in adds {
                    if !merged_adds.contains(p) {
                        merged_adds.push(p.clone());
                    }
                }
                let mut merged_removes: Vec<Pointer> = prior_removes
                    .iter()
                    .filter(|p| !adds.contains(p))
                    .cloned()
                    .collect();
                for p in removes {
                    if !merged_removes.contains(p) {
                        merged_removes.push(p.clone());
                    }
                }
                Ok(Op::Relation {
                    target_class: target_class.clone(),
                    adds: merged_adds,
                    removes: merged_removes,
                })
            }
            (Op::Relation { .. }, Op::Delete | Op::Set(_)) => Err(MooringError::illegal_argument(
                "You can't modify a relation after setting or deleting it.",
            )),

            _ => Err(MooringError::illegal_argument(
                "Operation is invalid after previous operation.",
            )),
        }
    }

    /// Applies this operation to the current value of field `key`.
    ///
    /// Returns `None` when the field should be removed.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] when the current value has
    /// the wrong type for this operation.
    pub fn apply(&self, old: Option<&Value>, key: &str) -> MooringResult<Option<Value>> {
        let old = old.filter(|v| !v.is_null());
        match self {
            FieldOperation::Set(value) => Ok(Some(value.clone())),
            FieldOperation::Delete => Ok(None),
            FieldOperation::Increment(amount) => match old {
                None => Ok(Some((*amount).into())),
                Some(value) => match value.as_number() {
                    Some(base) => Ok(Some(base.add(*amount).into())),
                    None => Err(MooringError::illegal_argument(format!(
                        "You cannot increment a non-number (key {key:?})."
                    ))),
                },
            },
            FieldOperation::Add(items) => {
                let mut list = existing_list(old, key)?;
                list.extend(items.iter().cloned());
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::AddUnique(items) => {
                let mut list = existing_list(old, key)?;
                push_unique(&mut list, items);
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::Remove(items) => {
                let mut list = existing_list(old, key)?;
                list.retain(|v| !items.iter().any(|r| same_value(v, r)));
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::Relation {
                target_class,
                adds,
                removes,
            } => {
                let mut relation = match old {
                    None => RelationRef::default(),
                    Some(Value::Relation(rel)) => rel.clone(),
                    Some(other) => {
                        return Err(MooringError::illegal_argument(format!(
                            "Operation is invalid after previous operation: key {key:?} holds {}.",
                            other.type_name()
                        )))
                    }
                };
                match &relation.target_class {
                    Some(existing) if existing != target_class => {
                        return Err(MooringError::illegal_argument(format!(
                            "Related object must be of class {existing}, \
                             but {target_class} was passed in."
                        )))
                    }
                    _ => relation.target_class = Some(target_class.clone()),
                }
                relation.known.retain(|p| !removes.contains(p));
                for p in adds {
                    if !relation.known.contains(p) {
                        relation.known.push(p.clone());
                    }
                }
                Ok(Some(Value::Relation(relation)))
            }
        }
    }

    /// Encodes this operation to its REST form.
    pub fn encode(&self) -> Json {
        match self {
            FieldOperation::Set(value) => encode_json(value),
            FieldOperation::Delete => json!({ "__op": "Delete" }),
            FieldOperation::Increment(amount) => {
                json!({ "__op": "Increment", "amount": encode_json(&(*amount).into()) })
            }
            FieldOperation::Add(items) => list_op("Add", items),
            FieldOperation::AddUnique(items) => list_op("AddUnique", items),
            FieldOperation::Remove(items) => list_op("Remove", items),
            FieldOperation::Relation { adds, removes, .. } => {
                let add = json!({
                    "__op": "AddRelation",
                    "objects": adds.iter().map(encode_pointer).collect::<Vec<_>>(),
                });
                let remove = json!({
                    "__op": "RemoveRelation",
                    "objects": removes.iter().map(encode_pointer).collect::<Vec<_>>(),
                });
                match (adds.is_empty(), removes.is_empty()) {
                    (false, false) => json!({ "__op": "Batch", "ops": [add, remove] }),
                    (true, false) => remove,
                    _ => add,
                }
            }
        }
    }

    /// Decodes an operation from its REST form. JSON without an `__op` tag is
    /// a [`FieldOperation::Set`].
    ///
    /// # Errors
    ///
    /// Returns an error for unknown `__op` names or malformed payloads.
    pub fn decode(json: &Json) -> MooringResult<FieldOperation> {
        let Some(op) = json.get("__op").and_then(Json::as_str) else {
            return Ok(FieldOperation::Set(decode_json(json)?));
        };
        match op {
            "Delete" => Ok(FieldOperation::Delete),
            "Increment" => {
                let amount = json.get("amount").map(decode_json).transpose()?;
                amount
                    .and_then(|a| a.as_number())
                    .map(FieldOperation::Increment)
                    .ok_or_else(|| {
                        MooringError::illegal_argument("Increment requires a numeric amount")
                    })
            }
            "Add" => Ok(FieldOperation::Add(decode_objects(json)?)),
            "AddUnique" => Ok(FieldOperation::AddUnique(decode_objects(json)?)),
            "Remove" => Ok(FieldOperation::Remove(decode_objects(json)?)),
            "AddRelation" | "RemoveRelation" => {
                let pointers = decode_objects(json)?
                    .into_iter()
                    .map(|v| match v {
                        Value::Pointer(p) => Ok(p),
                        other => Err(MooringError::illegal_argument(format!(
                            "relation operations take pointers, got {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<MooringResult<Vec<_>>>()?;
                let target_class = pointers
                    .first()
                    .map(|p| p.class_name.clone())
                    .ok_or_else(|| {
                        MooringError::illegal_argument("relation operation without objects")
                    })?;
                if pointers.iter().any(|p| p.class_name != target_class) {
                    return Err(MooringError::illegal_argument(
                        "All objects in a relation must be of the same class.",
                    ));
                }
                let (adds, removes) = if op == "AddRelation" {
                    (pointers, Vec::new())
                } else {
                    (Vec::new(), pointers)
                };
                Ok(FieldOperation::Relation {
                    target_class,
                    adds,
                    removes,
                })
            }
            "Batch" => {
                let ops = json
                    .get("ops")
                    .and_then(Json::as_array)
                    .ok_or_else(|| MooringError::illegal_argument("Batch requires ops"))?;
                let mut merged: Option<FieldOperation> = None;
                for item in ops {
                    let next = FieldOperation::decode(item)?;
                    merged = Some(match merged {
                        Some(previous) => next.merge_with_previous(&previous)?,
                        None => next,
                    });
                }
                merged.ok_or_else(|| MooringError::illegal_argument("empty Batch operation"))
            }
            other => Err(MooringError::illegal_argument(format!(
                "unknown operation {other:?}"
            ))),
        }
    }
}

/// Equality used by list operations: numbers compare by value.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x.compare(y).is_eq(),
        _ => a == b,
    }
}

fn push_unique(list: &mut Vec<Value>, items: &[Value]) {
    for item in items {
        if !list.iter().any(|v| same_value(v, item)) {
            list.push(item.clone());
        }
    }
}

fn existing_list(old: Option<&Value>, key: &str) -> MooringResult<Vec<Value>> {
    match old {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(MooringError::illegal_argument(format!(
            "Operation is invalid after previous operation: key {key:?} holds {}, not a list.",
            other.type_name()
        ))),
    }
}

fn list_op(name: &str, items: &[Value]) -> Json {
    json!({ "__op": name, "objects": items.iter().map(encode_json).collect::<Vec<_>>() })
}

fn decode_objects(json: &Json) -> MooringResult<Vec<Value>> {
    json.get("objects")
        .and_then(Json::as_array)
        .ok_or_else(|| MooringError::illegal_argument("operation requires objects"))?
        .iter()
        .map(|item| decode_json(item).map_err(MooringError::from))
        .collect()
}
