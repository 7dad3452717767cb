//! Per-class behavior selected by class name.

use crate::error::{MooringError, MooringResult};
use mooring_codec::Value;

/// Class name of users.
pub const USER_CLASS: &str = "_User";
/// Class name of installations.
pub const INSTALLATION_CLASS: &str = "_Installation";
/// Class name of roles.
pub const ROLE_CLASS: &str = "_Role";
/// Class name of sessions.
pub const SESSION_CLASS: &str = "_Session";
/// Class name of local pin records.
pub const PIN_CLASS: &str = "_Pin";

const USER_PROTECTED_KEYS: [&str; 3] = ["sessionToken", "authData", "isNew"];

const INSTALLATION_READONLY_KEYS: [&str; 10] = [
    "deviceType",
    "installationId",
    "deviceToken",
    "pushType",
    "timeZone",
    "localeIdentifier",
    "appVersion",
    "appName",
    "parseVersion",
    "appIdentifier",
];

const SESSION_READONLY_KEYS: [&str; 6] = [
    "sessionToken",
    "createdWith",
    "restricted",
    "user",
    "expiresAt",
    "installationId",
];

/// The built-in behaviors an object may carry, selected by its class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Any application-defined class.
    Regular,
    /// `_User`.
    User,
    /// `_Installation`.
    Installation,
    /// `_Role`.
    Role,
    /// `_Session`.
    Session,
    /// `_Pin`, local only.
    Pin,
}

impl ClassKind {
    /// Selects the behavior for `class_name`.
    pub fn of(class_name: &str) -> Self {
        match class_name {
            USER_CLASS => ClassKind::User,
            INSTALLATION_CLASS => ClassKind::Installation,
            ROLE_CLASS => ClassKind::Role,
            SESSION_CLASS => ClassKind::Session,
            PIN_CLASS => ClassKind::Pin,
            _ => ClassKind::Regular,
        }
    }

    /// Whether objects of this class carry a session token.
    pub fn is_session_bearing(self) -> bool {
        matches!(self, ClassKind::User | ClassKind::Session)
    }

    /// Whether the backend enforces a fixed schema for this class.
    pub fn is_schema_enforced(self) -> bool {
        matches!(
            self,
            ClassKind::User | ClassKind::Installation | ClassKind::Role | ClassKind::Session
        )
    }

    /// Checks that `key` may be set to `value` through a public `put`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] for protected or read-only
    /// keys and invalid role names, and [`MooringError::IllegalState`] when
    /// renaming a saved role.
    pub fn validate_put(self, key: &str, value: &Value, has_object_id: bool) -> MooringResult<()> {
        validate_key(key)?;
        match self {
            ClassKind::User if USER_PROTECTED_KEYS.contains(&key) => Err(
                MooringError::illegal_argument(format!("Can't modify {key} through put.")),
            ),
            ClassKind::Installation if INSTALLATION_READONLY_KEYS.contains(&key) => {
                Err(readonly(key, "_Installation"))
            }
            ClassKind::Session if SESSION_READONLY_KEYS.contains(&key) => {
                Err(readonly(key, "_Session"))
            }
            ClassKind::Role if key == "name" => {
                if has_object_id {
                    return Err(MooringError::illegal_state(
                        "A role's name can only be set before it has been saved.",
                    ));
                }
                let Some(name) = value.as_text() else {
                    return Err(MooringError::illegal_argument(
                        "A role's name must be a String.",
                    ));
                };
                if !is_valid_role_name(name) {
                    return Err(MooringError::illegal_argument(
                        "A role's name can only contain alphanumeric characters, _, -, and spaces.",
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Checks that `key` may be removed through a public `remove`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] for keys the class protects.
    pub fn validate_remove(self, key: &str) -> MooringResult<()> {
        validate_key(key)?;
        match self {
            ClassKind::User if key == "username" => Err(MooringError::illegal_argument(
                "Can't remove the username key.",
            )),
            ClassKind::Installation if INSTALLATION_READONLY_KEYS.contains(&key) => {
                Err(readonly(key, "_Installation"))
            }
            ClassKind::Session if SESSION_READONLY_KEYS.contains(&key) => {
                Err(readonly(key, "_Session"))
            }
            _ => Ok(()),
        }
    }
}

fn readonly(key: &str, class_name: &str) -> MooringError {
    MooringError::illegal_argument(format!(
        "Cannot modify `{key}` property of an {class_name} object."
    ))
}

fn validate_key(key: &str) -> MooringResult<()> {
    if key.is_empty() {
        return Err(MooringError::illegal_argument("field name must not be empty"));
    }
    Ok(())
}

fn is_valid_role_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '))
}

/// Validates a class name: an optional leading underscore, then a letter,
/// then letters, digits and underscores.
///
/// # Errors
///
/// Returns [`MooringError::IllegalArgument`] for anything else.
pub fn validate_class_name(class_name: &str) -> MooringResult<()> {
    let body = class_name.strip_prefix('_').unwrap_or(class_name);
    let mut chars = body.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MooringError::illegal_argument(format!(
            "invalid class name {class_name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn kind_is_selected_by_tag() {
        assert_eq!(ClassKind::of("_User"), ClassKind::User);
        assert_eq!(ClassKind::of("GameScore"), ClassKind::Regular);
        assert!(ClassKind::of("_Session").is_session_bearing());
        assert!(!ClassKind::of("_Pin").is_schema_enforced());
    }

    #[test]
    fn user_protects_session_keys() {
        let user = ClassKind::User;
        assert!(user
            .validate_put("sessionToken", &"r:abc".into(), false)
            .is_err());
        assert!(user.validate_put("email", &"a@b.c".into(), false).is_ok());
        assert!(user.validate_remove("username").is_err());
    }

    #[test]
    fn installation_readonly_keys() {
        let err = ClassKind::Installation
            .validate_put("deviceType", &"ios".into(), false)
            .unwrap_err();
        assert!(err.to_string().contains("deviceType"));
        assert!(ClassKind::Installation
            .validate_put("channels", &Value::Array(vec![]), false)
            .is_ok());
    }

    #[test]
    fn role_name_rules() {
        let role = ClassKind::Role;
        assert!(role.validate_put("name", &"Admins-1 _x".into(), false).is_ok());
        assert_eq!(
            role.validate_put("name", &"bad!".into(), false)
                .unwrap_err()
                .kind(),
            ErrorKind::IllegalArgument
        );
        assert_eq!(
            role.validate_put("name", &"Admins".into(), true)
                .unwrap_err()
                .kind(),
            ErrorKind::IllegalState
        );
    }

    #[test]
    fn class_names() {
        assert!(validate_class_name("GameScore").is_ok());
        assert!(validate_class_name("_User").is_ok());
        for bad in ["", "_", "9lives", "has space", "dash-ed"] {
            assert!(validate_class_name(bad).is_err(), "{bad:?}");
        }
    }
}
