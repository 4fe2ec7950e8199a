//! Builds the default [`ActivityCatalog`] from configuration.

use std::sync::Arc;
use std::time::Duration;

use super::activities::{CallPartnerApi, RecordOutcome, ValidateDocument};
use super::{activity_names, ActivityCatalog, CatalogError};
use crate::config::ActivitySettings;

/// Creates the activities every workflow builder may reference.
///
/// Stateless; each call yields a fresh catalog so that a reload never shares
/// HTTP clients or settings with the catalog it replaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogFactory;

impl CatalogFactory {
    /// Builds the catalog for the given settings.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::InvalidConfiguration` if the partner API client
    /// cannot be constructed.
    pub fn create(settings: &ActivitySettings) -> Result<ActivityCatalog, CatalogError> {
        let partner = match settings.partner_api_url.as_deref() {
            Some(url) => CallPartnerApi::new(url, Duration::from_millis(settings.partner_api_timeout_ms))
                .map_err(|e| CatalogError::InvalidConfiguration {
                    name: activity_names::CALL_PARTNER_API.into(),
                    reason: e.to_string(),
                })?,
            None => CallPartnerApi::dry_run(),
        };

        ActivityCatalog::builder()
            .register(activity_names::VALIDATE_DOCUMENT, Arc::new(ValidateDocument))
            .register(activity_names::CALL_PARTNER_API, Arc::new(partner))
            .register(activity_names::RECORD_OUTCOME, Arc::new(RecordOutcome))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_register_all_activities() {
        let catalog = CatalogFactory::create(&ActivitySettings::default()).unwrap();
        assert_eq!(catalog.len(), 3);
        for name in [
            activity_names::VALIDATE_DOCUMENT,
            activity_names::CALL_PARTNER_API,
            activity_names::RECORD_OUTCOME,
        ] {
            assert!(catalog.contains(name), "missing {name}");
        }
    }

    #[test]
    fn partner_url_builds_live_client() {
        let settings = ActivitySettings {
            partner_api_url: Some("https://partner.example.com/api/".to_string()),
            ..ActivitySettings::default()
        };
        let catalog = CatalogFactory::create(&settings).unwrap();
        assert!(catalog.contains(activity_names::CALL_PARTNER_API));
    }

    #[test]
    fn each_call_yields_a_distinct_catalog() {
        let a = CatalogFactory::create(&ActivitySettings::default()).unwrap();
        let b = CatalogFactory::create(&ActivitySettings::default()).unwrap();
        let a_act = a.get(activity_names::VALIDATE_DOCUMENT).unwrap();
        let b_act = b.get(activity_names::VALIDATE_DOCUMENT).unwrap();
        assert!(!Arc::ptr_eq(&a_act, &b_act));
    }
}
