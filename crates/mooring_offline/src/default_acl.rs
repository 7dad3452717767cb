//! The ACL applied to new objects.

use mooring_core::{Acl, SyncObject};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct DefaultAcl {
    acl: Option<Acl>,
    with_access_for_current_user: bool,
    /// Last user the ACL was derived for, and the result.
    derived: Option<(Weak<SyncObject>, Acl)>,
}

/// Holds the default ACL and, when asked to, the variant granting the
/// current user read and write access.
#[derive(Debug, Default)]
pub struct DefaultAclController {
    inner: Mutex<DefaultAcl>,
}

impl DefaultAclController {
    /// Creates a controller with no default ACL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default ACL. With `with_access_for_current_user`, objects
    /// also grant the user current at creation time read and write access.
    pub fn set(&self, acl: Option<Acl>, with_access_for_current_user: bool) {
        let mut inner = self.inner.lock();
        inner.acl = acl;
        inner.with_access_for_current_user = with_access_for_current_user;
        inner.derived = None;
    }

    /// The ACL for an object created while `current_user` is current.
    pub fn get(&self, current_user: Option<&Arc<SyncObject>>) -> Option<Acl> {
        let mut inner = self.inner.lock();
        let acl = inner.acl.clone()?;
        if !inner.with_access_for_current_user {
            return Some(acl);
        }
        let Some(user) = current_user else {
            return Some(acl);
        };
        if let Some((cached_user, derived)) = &inner.derived {
            if cached_user.upgrade().is_some_and(|cached| Arc::ptr_eq(&cached, user)) {
                return Some(derived.clone());
            }
        }
        // A user without any identity yet cannot be named in an ACL.
        let Some(key) = user.key() else {
            return Some(acl);
        };
        let mut derived = acl;
        derived.set_read_access(&key, true);
        derived.set_write_access(&key, true);
        tracing::trace!(user = key.as_str(), "default ACL derived for current user");
        inner.derived = Some((Arc::downgrade(user), derived.clone()));
        Some(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::USER_CLASS;

    fn user(local_id: &str) -> Arc<SyncObject> {
        let user = SyncObject::new(USER_CLASS).unwrap();
        user.set_local_id(local_id).unwrap();
        user
    }

    #[test]
    fn plain_default_is_returned_as_is() {
        let controller = DefaultAclController::new();
        assert!(controller.get(None).is_none());
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        controller.set(Some(acl.clone()), false);
        assert_eq!(controller.get(Some(&user("local_0000000000000001"))), Some(acl));
    }

    #[test]
    fn derived_acl_follows_current_user() {
        let controller = DefaultAclController::new();
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        controller.set(Some(acl.clone()), true);

        let ann = user("local_0000000000000001");
        let derived = controller.get(Some(&ann)).unwrap();
        assert_ne!(derived, acl);
        assert_eq!(controller.get(Some(&ann)).unwrap(), derived);

        let bob = user("local_0000000000000002");
        let for_bob = controller.get(Some(&bob)).unwrap();
        assert_ne!(for_bob, derived);
    }

    #[test]
    fn stale_user_is_not_kept_alive() {
        let controller = DefaultAclController::new();
        controller.set(Some(Acl::new()), true);
        let ann = user("local_0000000000000001");
        let weak = Arc::downgrade(&ann);
        controller.get(Some(&ann));
        drop(ann);
        assert!(weak.upgrade().is_none());
    }
}
