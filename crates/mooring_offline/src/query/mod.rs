//! Offline query evaluation.
//!
//! Queries run against the rows of the local datastore (optionally limited
//! to one pin) in four steps:
//!
//! 1. validate the constraint tree, so malformed queries fail up front
//! 2. filter candidates on visibility and constraints
//! 3. sort (distance to a `$nearSphere` point first, then order keys)
//! 4. apply skip and limit, then load includes for the survivors

mod include;
mod matcher;
mod sort;

use crate::datastore::LocalDatastore;
use mooring_core::{AccessContext, MooringResult, QueryState, SyncObject};
use std::sync::Arc;

/// Evaluates queries against a [`LocalDatastore`] on behalf of one acting
/// user.
pub struct OfflineQueryEngine<'a> {
    store: &'a LocalDatastore,
    access: &'a AccessContext,
}

impl<'a> OfflineQueryEngine<'a> {
    /// Creates an engine reading `store` as `access`.
    pub fn new(store: &'a LocalDatastore, access: &'a AccessContext) -> Self {
        Self { store, access }
    }

    fn is_live(object: &SyncObject) -> bool {
        !object.is_deleted() && object.deleting_eventually_count() == 0
    }

    /// Filters and sorts `candidates` without skip, limit or includes.
    fn matching(
        &self,
        query: &QueryState,
        candidates: Vec<Arc<SyncObject>>,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        matcher::validate_query(query)?;
        let matcher = matcher::Matcher::new(self.store, self.access);
        let mut results = Vec::new();
        for candidate in candidates {
            if Self::is_live(&candidate) && matcher.matches_query(query, &candidate)? {
                results.push(candidate);
            }
        }
        sort::sort_objects(&matcher, query, &mut results)?;
        Ok(results)
    }

    /// Runs `query` over the objects of its class in the local datastore,
    /// or over the pin the query names.
    ///
    /// # Errors
    ///
    /// - [`mooring_core::MooringError::InvalidQuery`] for an unsupported
    ///   operator, regex option, geo box or sort key
    /// - [`mooring_core::MooringError::IllegalArgument`] for incomparable
    ///   values or a mixed `$all` list
    /// - [`mooring_core::MooringError::IllegalState`] for an include path
    ///   reaching a non-pointer
    pub fn find(&self, query: &QueryState) -> MooringResult<Vec<Arc<SyncObject>>> {
        let candidates = self
            .store
            .objects_of_class(query.class_name(), query.pin_name())?;
        self.find_in(query, candidates)
    }

    /// Runs `query` over in-memory `candidates`.
    ///
    /// # Errors
    ///
    /// As [`OfflineQueryEngine::find`].
    pub fn find_in(
        &self,
        query: &QueryState,
        candidates: Vec<Arc<SyncObject>>,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        let results = self.matching(query, candidates)?;
        let limit = query.limit().unwrap_or(usize::MAX);
        let page: Vec<Arc<SyncObject>> = results
            .into_iter()
            .skip(query.skip())
            .take(limit)
            .collect();
        for object in &page {
            for path in query.include() {
                include::fetch_include(self.store, object, path)?;
            }
        }
        tracing::debug!(
            class = query.class_name(),
            pin = query.pin_name(),
            results = page.len(),
            "offline query evaluated"
        );
        Ok(page)
    }

    /// Number of matching objects, ignoring skip and limit.
    ///
    /// # Errors
    ///
    /// As [`OfflineQueryEngine::find`].
    pub fn count(&self, query: &QueryState) -> MooringResult<usize> {
        let candidates = self
            .store
            .objects_of_class(query.class_name(), query.pin_name())?;
        Ok(self.matching(query, candidates)?.len())
    }

    /// Whether `object` is visible and satisfies `query`.
    ///
    /// # Errors
    ///
    /// As [`OfflineQueryEngine::find`].
    pub fn matches(&self, query: &QueryState, object: &SyncObject) -> MooringResult<bool> {
        matcher::validate_query(query)?;
        matcher::Matcher::new(self.store, self.access).matches_query(query, object)
    }
}
