//! SDK configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for building a Mooring context.
#[derive(Debug, Clone)]
pub struct MooringConfig {
    /// App-private directory for persisted state. `None` keeps everything
    /// in memory.
    pub storage_root: Option<PathBuf>,

    /// Whether the local datastore (pins, offline queries) is enabled.
    pub local_datastore_enabled: bool,

    /// Device type reported on new installations.
    pub device_type: String,

    /// Time zone reported on new installations.
    pub time_zone: String,

    /// Maximum age of a cached query result.
    pub query_cache_max_age: Duration,

    /// Whether an anonymous user is created when no current user exists.
    pub auto_create_anonymous_user: bool,
}

impl Default for MooringConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            local_datastore_enabled: false,
            device_type: "embedded".to_string(),
            time_zone: "UTC".to_string(),
            query_cache_max_age: Duration::from_secs(60 * 60), // 1 hour
            auto_create_anonymous_user: false,
        }
    }
}

impl MooringConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the storage root directory.
    #[must_use]
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Enables or disables the local datastore.
    #[must_use]
    pub const fn local_datastore_enabled(mut self, value: bool) -> Self {
        self.local_datastore_enabled = value;
        self
    }

    /// Sets the device type reported on new installations.
    #[must_use]
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Sets the time zone reported on new installations.
    #[must_use]
    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    /// Sets the maximum age of cached query results.
    #[must_use]
    pub const fn query_cache_max_age(mut self, age: Duration) -> Self {
        self.query_cache_max_age = age;
        self
    }

    /// Sets whether an anonymous user is created on demand.
    #[must_use]
    pub const fn auto_create_anonymous_user(mut self, value: bool) -> Self {
        self.auto_create_anonymous_user = value;
        self
    }
}
