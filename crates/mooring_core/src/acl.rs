//! Access control lists and read/write visibility checks.

use crate::class::USER_CLASS;
use crate::error::{MooringError, MooringResult};
use crate::local_id::is_local_id;
use crate::object::SyncObject;
use mooring_codec::{ObjectKey, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Field holding an object's ACL.
pub const ACL_KEY: &str = "ACL";

const PUBLIC_KEY: &str = "*";
const ROLE_PREFIX: &str = "role:";

/// Read and write flags for one principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Read access.
    pub read: bool,
    /// Write access.
    pub write: bool,
}

/// An access control list.
///
/// Principals are the public (`*`), users keyed by object id (or by local
/// id while unsaved) and roles (`role:<name>`). The REST form is
/// `{"*":{"read":true},"<userId>":{"write":true}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    entries: BTreeMap<String, Permissions>,
}

impl Acl {
    /// Creates an ACL granting nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an ACL granting read and write to a single user.
    pub fn for_user(user: &ObjectKey) -> Self {
        let mut acl = Self::new();
        acl.set_read_access(user, true);
        acl.set_write_access(user, true);
        acl
    }

    fn set(&mut self, principal: String, update: impl FnOnce(&mut Permissions)) {
        let mut permissions = self.entries.get(&principal).copied().unwrap_or_default();
        update(&mut permissions);
        if permissions == Permissions::default() {
            self.entries.remove(&principal);
        } else {
            self.entries.insert(principal, permissions);
        }
    }

    fn get(&self, principal: &str) -> Permissions {
        self.entries.get(principal).copied().unwrap_or_default()
    }

    /// Sets public read access.
    pub fn set_public_read_access(&mut self, allowed: bool) {
        self.set(PUBLIC_KEY.to_string(), |p| p.read = allowed);
    }

    /// Sets public write access.
    pub fn set_public_write_access(&mut self, allowed: bool) {
        self.set(PUBLIC_KEY.to_string(), |p| p.write = allowed);
    }

    /// Public read access.
    pub fn public_read_access(&self) -> bool {
        self.get(PUBLIC_KEY).read
    }

    /// Public write access.
    pub fn public_write_access(&self) -> bool {
        self.get(PUBLIC_KEY).write
    }

    /// Sets read access for a user.
    pub fn set_read_access(&mut self, user: &ObjectKey, allowed: bool) {
        self.set(user.as_str().to_string(), |p| p.read = allowed);
    }

    /// Sets write access for a user.
    pub fn set_write_access(&mut self, user: &ObjectKey, allowed: bool) {
        self.set(user.as_str().to_string(), |p| p.write = allowed);
    }

    /// Read access granted explicitly to a user.
    pub fn read_access(&self, user: &ObjectKey) -> bool {
        self.get(user.as_str()).read
    }

    /// Write access granted explicitly to a user.
    pub fn write_access(&self, user: &ObjectKey) -> bool {
        self.get(user.as_str()).write
    }

    /// Sets read access for a role.
    pub fn set_role_read_access(&mut self, role: &str, allowed: bool) {
        self.set(format!("{ROLE_PREFIX}{role}"), |p| p.read = allowed);
    }

    /// Sets write access for a role.
    pub fn set_role_write_access(&mut self, role: &str, allowed: bool) {
        self.set(format!("{ROLE_PREFIX}{role}"), |p| p.write = allowed);
    }

    /// Read access granted to a role.
    pub fn role_read_access(&self, role: &str) -> bool {
        self.get(&format!("{ROLE_PREFIX}{role}")).read
    }

    /// Write access granted to a role.
    pub fn role_write_access(&self, role: &str) -> bool {
        self.get(&format!("{ROLE_PREFIX}{role}")).write
    }

    /// Whether any user is keyed by a local id.
    pub fn has_unresolved_user(&self) -> bool {
        self.entries.keys().any(|k| is_local_id(k))
    }

    /// Rewrites the entry of a user saved since the ACL was built.
    pub fn resolve_user(&mut self, local_id: &str, object_id: &str) {
        if let Some(permissions) = self.entries.remove(local_id) {
            self.entries.insert(object_id.to_string(), permissions);
        }
    }

    fn grants(
        &self,
        user: Option<&ObjectKey>,
        roles: &BTreeSet<String>,
        pick: fn(Permissions) -> bool,
    ) -> bool {
        if pick(self.get(PUBLIC_KEY)) {
            return true;
        }
        if user.is_some_and(|u| pick(self.get(u.as_str()))) {
            return true;
        }
        roles
            .iter()
            .any(|role| pick(self.get(&format!("{ROLE_PREFIX}{role}"))))
    }

    /// Converts to the field value stored on objects.
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .map(|(principal, p)| {
                    let mut flags = BTreeMap::new();
                    if p.read {
                        flags.insert("read".to_string(), Value::Bool(true));
                    }
                    if p.write {
                        flags.insert("write".to_string(), Value::Bool(true));
                    }
                    (principal.clone(), Value::Map(flags))
                })
                .collect(),
        )
    }

    /// Parses the field value stored on objects.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if `value` is not an ACL map.
    pub fn from_value(value: &Value) -> MooringResult<Acl> {
        let map = value
            .as_map()
            .ok_or_else(|| MooringError::illegal_argument("ACL must be a map"))?;
        let mut acl = Acl::new();
        for (principal, flags) in map {
            let flags = flags.as_map().ok_or_else(|| {
                MooringError::illegal_argument(format!("ACL entry for {principal} must be a map"))
            })?;
            let flag = |name: &str| flags.get(name).and_then(Value::as_bool).unwrap_or(false);
            let permissions = Permissions {
                read: flag("read"),
                write: flag("write"),
            };
            if permissions != Permissions::default() {
                acl.entries.insert(principal.clone(), permissions);
            }
        }
        Ok(acl)
    }
}

/// The acting principal for visibility checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext {
    user: Option<ObjectKey>,
    roles: BTreeSet<String>,
}

impl AccessContext {
    /// A context with no user and no roles.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A context acting as `user`.
    pub fn for_user(user: ObjectKey) -> Self {
        Self {
            user: Some(user),
            roles: BTreeSet::new(),
        }
    }

    /// Adds roles the acting user holds.
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.roles.extend(roles);
        self
    }

    /// The acting user.
    pub fn user(&self) -> Option<&ObjectKey> {
        self.user.as_ref()
    }

    fn is_object_itself(&self, object: &SyncObject) -> bool {
        let Some(user) = &self.user else {
            return false;
        };
        if object.class_name() != USER_CLASS {
            return false;
        }
        match user {
            ObjectKey::ObjectId(id) => object.object_id().as_deref() == Some(id.as_str()),
            ObjectKey::LocalId(id) => object.local_id().as_deref() == Some(id.as_str()),
        }
    }

    fn allows(&self, object: &SyncObject, pick: fn(Permissions) -> bool) -> bool {
        if self.is_object_itself(object) {
            return true;
        }
        match object.acl() {
            Ok(None) => true,
            Ok(Some(acl)) => acl.grants(self.user.as_ref(), &self.roles, pick),
            Err(_) => false,
        }
    }

    /// Whether the acting user may read `object`.
    pub fn can_read(&self, object: &SyncObject) -> bool {
        self.allows(object, |p| p.read)
    }

    /// Whether the acting user may write `object`.
    pub fn can_write(&self, object: &SyncObject) -> bool {
        self.allows(object, |p| p.write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_round_trip_through_field_value() {
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        acl.set_write_access(&ObjectKey::ObjectId("u1".into()), true);
        acl.set_role_read_access("Admins", true);

        let parsed = Acl::from_value(&acl.to_value()).unwrap();
        assert_eq!(parsed, acl);
        assert!(parsed.public_read_access());
        assert!(!parsed.public_write_access());
        assert!(parsed.role_read_access("Admins"));
    }

    #[test]
    fn revoking_everything_drops_the_entry() {
        let user = ObjectKey::ObjectId("u1".into());
        let mut acl = Acl::for_user(&user);
        acl.set_read_access(&user, false);
        acl.set_write_access(&user, false);
        assert_eq!(acl, Acl::new());
    }

    #[test]
    fn grants_through_user_role_or_public() {
        let user = ObjectKey::ObjectId("u1".into());
        let roles: BTreeSet<String> = ["Mods".to_string()].into();

        let mut acl = Acl::new();
        assert!(!acl.grants(Some(&user), &roles, |p| p.read));

        acl.set_role_read_access("Mods", true);
        assert!(acl.grants(Some(&user), &roles, |p| p.read));
        assert!(!acl.grants(Some(&user), &BTreeSet::new(), |p| p.read));

        acl.set_public_read_access(true);
        assert!(acl.grants(None, &BTreeSet::new(), |p| p.read));
    }

    #[test]
    fn write_checks_on_objects() {
        let post = SyncObject::new("Post").unwrap();
        let anyone = AccessContext::anonymous();
        assert!(anyone.can_write(&post));

        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        acl.set_role_write_access("Editors", true);
        post.set_acl(&acl).unwrap();
        assert!(acl.role_write_access("Editors"));
        assert!(anyone.can_read(&post));
        assert!(!anyone.can_write(&post));

        let editor = AccessContext::for_user(ObjectKey::ObjectId("u1".into()))
            .with_roles(["Editors".to_string()]);
        assert!(editor.can_write(&post));

        acl.set_public_write_access(true);
        post.set_acl(&acl).unwrap();
        assert!(anyone.can_write(&post));
    }

    #[test]
    fn users_may_always_write_themselves() {
        let user = SyncObject::new(USER_CLASS).unwrap();
        user.set_local_id("local_00000000000000bb").unwrap();
        user.set_acl(&Acl::new()).unwrap();
        let me = AccessContext::for_user(ObjectKey::LocalId("local_00000000000000bb".into()));
        assert!(me.can_write(&user));
        assert!(!AccessContext::anonymous().can_write(&user));
    }

    #[test]
    fn unresolved_users_resolve_in_place() {
        let local = ObjectKey::LocalId("local_00000000000000aa".into());
        let mut acl = Acl::for_user(&local);
        assert!(acl.has_unresolved_user());
        acl.resolve_user("local_00000000000000aa", "srv1");
        assert!(!acl.has_unresolved_user());
        assert!(acl.write_access(&ObjectKey::ObjectId("srv1".into())));
    }
}
