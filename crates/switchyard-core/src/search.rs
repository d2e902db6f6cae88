//! Search backend interface
//!
//! The platform's contact search is a full-text index maintained out of
//! process. The worker tier only needs one operation from it: resolving a
//! query string to contact IDs.

use async_trait::async_trait;
use switchyard_common::types::{ContactId, ContactStatus, OrgId};
use switchyard_common::{Error, Result};

/// A backend able to resolve contact search queries
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Resolve a query to the matching contact IDs for an org, optionally
    /// restricted to one contact status
    async fn contact_ids_for_query(
        &self,
        org_id: OrgId,
        query: &str,
        status: Option<ContactStatus>,
    ) -> Result<Vec<ContactId>>;
}

/// Placeholder backend for deployments without a search index. Any query
/// errors rather than silently matching nothing.
pub struct UnconfiguredSearch;

#[async_trait]
impl SearchBackend for UnconfiguredSearch {
    async fn contact_ids_for_query(
        &self,
        _org_id: OrgId,
        query: &str,
        _status: Option<ContactStatus>,
    ) -> Result<Vec<ContactId>> {
        Err(Error::Search(format!(
            "no search backend configured, can't resolve query: {}",
            query
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_backend_errors() {
        let backend = UnconfiguredSearch;
        let err = backend
            .contact_ids_for_query(1, "age > 33", Some(ContactStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Search(_)));
    }
}
