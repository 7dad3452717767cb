//! Many-to-many relation fields.

use crate::error::{MooringError, MooringResult};
use crate::object::SyncObject;
use crate::operation::FieldOperation;
use crate::query::{QueryBuilder, QueryState};
use mooring_codec::Pointer;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct Binding {
    parent: Weak<SyncObject>,
    key: Option<String>,
}

/// A handle on one relation field of one object.
///
/// Adding and removing members queues relation operations on the parent.
/// A relation is bound to exactly one parent and key.
#[derive(Debug)]
pub struct Relation {
    binding: Mutex<Binding>,
    target_class: Mutex<Option<String>>,
}

impl Relation {
    /// Creates an unbound relation.
    pub fn new(target_class: Option<String>) -> Self {
        Self {
            binding: Mutex::new(Binding::default()),
            target_class: Mutex::new(target_class),
        }
    }

    pub(crate) fn bind(&self, parent: Weak<SyncObject>, key: &str) {
        let mut binding = self.binding.lock();
        binding.parent = parent;
        binding.key = Some(key.to_string());
    }

    /// Binds this relation to `parent` and `key`, or checks that it already
    /// is.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if the relation is bound to a
    /// different parent or key.
    pub fn ensure_parent_and_key(&self, parent: &Arc<SyncObject>, key: &str) -> MooringResult<()> {
        let mut binding = self.binding.lock();
        if let Some(existing) = binding.parent.upgrade() {
            if !Arc::ptr_eq(&existing, parent) {
                return Err(MooringError::illegal_state(
                    "One relation was retrieved from two different objects.",
                ));
            }
        }
        if let Some(existing) = &binding.key {
            if existing != key {
                return Err(MooringError::illegal_state(
                    "One relation was retrieved from two different keys.",
                ));
            }
        }
        binding.parent = Arc::downgrade(parent);
        binding.key = Some(key.to_string());
        Ok(())
    }

    /// Class of the related objects, once known.
    pub fn target_class(&self) -> Option<String> {
        self.target_class.lock().clone()
    }

    /// Relation field name, once bound.
    pub fn key(&self) -> Option<String> {
        self.binding.lock().key.clone()
    }

    fn parent_and_key(&self) -> MooringResult<(Arc<SyncObject>, String)> {
        let binding = self.binding.lock();
        match (binding.parent.upgrade(), &binding.key) {
            (Some(parent), Some(key)) => Ok((parent, key.clone())),
            _ => Err(MooringError::illegal_state(
                "relation is not bound to a live object",
            )),
        }
    }

    fn modify(
        &self,
        target: &Pointer,
        adds: Vec<Pointer>,
        removes: Vec<Pointer>,
    ) -> MooringResult<()> {
        let (parent, key) = self.parent_and_key()?;
        parent.perform_operation(
            &key,
            FieldOperation::Relation {
                target_class: target.class_name.clone(),
                adds,
                removes,
            },
        )?;
        *self.target_class.lock() = Some(target.class_name.clone());
        Ok(())
    }

    /// Adds `target` to the relation.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation is unbound or `target` has another
    /// class than earlier members.
    pub fn add(&self, target: &Pointer) -> MooringResult<()> {
        self.modify(target, vec![target.clone()], Vec::new())
    }

    /// Removes `target` from the relation.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation is unbound or `target` has another
    /// class than earlier members.
    pub fn remove(&self, target: &Pointer) -> MooringResult<()> {
        self.modify(target, Vec::new(), vec![target.clone()])
    }

    /// A query over the relation's members.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if the target class is unknown
    /// or the parent has no identity yet.
    pub fn query(&self) -> MooringResult<QueryBuilder> {
        let target = self
            .target_class()
            .ok_or_else(|| MooringError::illegal_state("relation target class is unknown"))?;
        let (parent, key) = self.parent_and_key()?;
        let pointer = parent.pointer().ok_or_else(|| {
            MooringError::illegal_state("cannot query a relation of an object without an id")
        })?;
        Ok(QueryState::builder(target).where_related_to(pointer, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mooring_codec::Value;

    #[test]
    fn add_queues_relation_operation() {
        let post = SyncObject::without_data("Post", "p1").unwrap();
        let relation = post.relation("likes").unwrap();
        relation.add(&Pointer::new("_User", "u1")).unwrap();
        relation.add(&Pointer::new("_User", "u2")).unwrap();
        relation.remove(&Pointer::new("_User", "u1")).unwrap();

        match post.get("likes").unwrap() {
            Some(Value::Relation(rel)) => {
                assert_eq!(rel.target_class.as_deref(), Some("_User"));
                assert_eq!(rel.known, vec![Pointer::new("_User", "u2")]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relation.target_class().as_deref(), Some("_User"));
    }

    #[test]
    fn mixed_target_classes_are_rejected() {
        let post = SyncObject::without_data("Post", "p1").unwrap();
        let relation = post.relation("likes").unwrap();
        relation.add(&Pointer::new("_User", "u1")).unwrap();
        assert!(relation.add(&Pointer::new("Comment", "c1")).is_err());
    }

    #[test]
    fn rebinding_is_illegal_state() {
        let a = SyncObject::without_data("Post", "a").unwrap();
        let b = SyncObject::without_data("Post", "b").unwrap();
        let relation = a.relation("likes").unwrap();

        relation.ensure_parent_and_key(&a, "likes").unwrap();
        assert_eq!(
            relation.ensure_parent_and_key(&b, "likes").unwrap_err().kind(),
            ErrorKind::IllegalState
        );
        assert_eq!(
            relation.ensure_parent_and_key(&a, "fans").unwrap_err().kind(),
            ErrorKind::IllegalState
        );
    }

    #[test]
    fn query_targets_related_class() {
        let post = SyncObject::without_data("Post", "p1").unwrap();
        let relation = post.relation("likes").unwrap();
        assert!(relation.query().is_err());

        relation.add(&Pointer::new("_User", "u1")).unwrap();
        let query = relation.query().unwrap().build();
        assert_eq!(query.class_name(), "_User");
        let related = query.constraints().related_to.as_ref().unwrap();
        assert_eq!(related.key, "likes");
        assert_eq!(related.object, Pointer::new("Post", "p1"));
    }
}
