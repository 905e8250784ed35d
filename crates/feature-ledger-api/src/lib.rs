use std::path::PathBuf;

use anyhow::{anyhow, Result};
use feature_ledger_core::{
    Cart, CustomObject, Feature, FeatureCatalog, LedgerError, ShopperContext, FEATURES_CONTAINER,
};
use feature_ledger_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod synchronizer;

pub use synchronizer::{
    load_catalog, CartService, CartSynchronizer, CatalogService, FeatureUseOutcome,
    UsedFeaturesView,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddFeatureRequest {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFeatureUseRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveFeatureResult {
    pub key: String,
    pub removed: bool,
}

/// Facade over a local SQLite database acting as catalog and cart backend.
#[derive(Debug, Clone)]
pub struct FeatureLedgerApi {
    db_path: PathBuf,
    shopper: ShopperContext,
}

impl FeatureLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, shopper: ShopperContext) -> Self {
        Self { db_path, shopper }
    }

    #[must_use]
    pub fn shopper(&self) -> &ShopperContext {
        &self.shopper
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Add or replace one catalog feature, keyed by `key`.
    ///
    /// # Errors
    /// Returns an error when the feature is invalid or cannot be persisted.
    pub fn add_feature(&self, input: AddFeatureRequest) -> Result<Feature> {
        let feature = Feature {
            id: input.id.unwrap_or_else(|| Ulid::new().to_string()),
            key: input.key,
            name: input.name,
            description: input.description,
        };
        feature.validate()?;

        let mut store = self.open_migrated_store()?;
        let object = CustomObject::from_feature(&feature);
        let stored = store.upsert_custom_object(
            FEATURES_CONTAINER,
            &object.key,
            &object.value,
            Some(&feature.id),
        )?;
        Ok(Feature { id: stored.id, ..feature })
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_features(&self) -> Result<Vec<Feature>> {
        let store = self.open_migrated_store()?;
        Ok(load_catalog(&store)?.features().to_vec())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_feature(&self, key: &str) -> Result<RemoveFeatureResult> {
        let mut store = self.open_migrated_store()?;
        let removed = store.delete_custom_object(FEATURES_CONTAINER, key)?;
        Ok(RemoveFeatureResult { key: key.to_string(), removed })
    }

    /// # Errors
    /// Returns an error when the cart cannot be read.
    pub fn active_cart(&self) -> Result<Option<Cart>> {
        let store = self.open_migrated_store()?;
        store.active_cart()
    }

    /// Like [`Self::active_cart`], but a missing cart is an error.
    ///
    /// # Errors
    /// Returns an error when no cart exists yet or the cart cannot be read.
    pub fn show_cart(&self) -> Result<Cart> {
        self.active_cart()?.ok_or_else(|| anyhow!("no active cart"))
    }

    /// Record one feature use on the active cart, creating the cart when needed.
    ///
    /// # Errors
    /// Returns an error when the key is blank or any store call fails.
    pub fn record_feature_use(&self, input: &RecordFeatureUseRequest) -> Result<FeatureUseOutcome> {
        if input.key.trim().is_empty() {
            return Err(LedgerError::Validation("feature key must not be empty".to_string()).into());
        }
        let mut sync = self.synchronizer()?;
        sync.record_feature_use(&input.key)
    }

    /// # Errors
    /// Returns an error when the catalog or the active cart cannot be read.
    pub fn used_features(&self) -> Result<UsedFeaturesView> {
        self.synchronizer()?.used_features()
    }

    fn synchronizer(&self) -> Result<CartSynchronizer<SqliteStore>> {
        let store = self.open_migrated_store()?;
        let catalog: FeatureCatalog = load_catalog(&store)?;
        Ok(CartSynchronizer::new(store, catalog, self.shopper.clone()))
    }
}

#[cfg(test)]
mod tests {
    use feature_ledger_core::Decision;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("feature-ledger-api-{}.sqlite3", Ulid::new()))
    }

    fn api(db_path: PathBuf) -> FeatureLedgerApi {
        FeatureLedgerApi::new(
            db_path,
            ShopperContext { currency: "EUR".to_string(), country: "DE".to_string() },
        )
    }

    fn add(api: &FeatureLedgerApi, id: &str, key: &str, name: &str) -> Result<Feature> {
        api.add_feature(AddFeatureRequest {
            key: key.to_string(),
            name: name.to_string(),
            description: format!("{name} description"),
            id: Some(id.to_string()),
        })
    }

    fn use_request(key: &str) -> RecordFeatureUseRequest {
        RecordFeatureUseRequest { key: key.to_string() }
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_records_feature_use_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api(db_path.clone());
        add(&api, "f1", "gift-wrap", "Gift wrap")?;
        add(&api, "f2", "express", "Express shipping")?;

        let first = api.record_feature_use(&use_request("gift-wrap"))?;
        assert!(first.cart_created);
        assert!(first.cart_updated);

        let again = api.record_feature_use(&use_request("gift-wrap"))?;
        assert_eq!(again.decision, Decision::AlreadyRecorded);
        assert_eq!(again.cart_id, first.cart_id);

        let second = api.record_feature_use(&use_request("express"))?;
        assert_eq!(second.used_feature_ids, vec!["f1".to_string(), "f2".to_string()]);

        let cart = api.show_cart()?;
        assert_eq!(cart.id, first.cart_id);
        assert_eq!(cart.version, 3);
        assert_eq!(
            cart.custom_field("features").map(|field| field.value.clone()),
            Some(serde_json::json!([
                {"typeId": "key-value-document", "id": "f1"},
                {"typeId": "key-value-document", "id": "f2"}
            ]))
        );

        let used = api.used_features()?;
        let names = used.features.iter().map(|feature| feature.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Gift wrap", "Express shipping"]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_catalog_add_replace_and_remove() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api(db_path.clone());

        let generated = api.add_feature(AddFeatureRequest {
            key: "gift-wrap".to_string(),
            name: "Gift wrap".to_string(),
            description: String::new(),
            id: None,
        })?;
        assert!(!generated.id.is_empty());

        let replaced = add(&api, "other", "gift-wrap", "Gift wrapping")?;
        assert_eq!(replaced.id, generated.id);

        let features = api.list_features()?;
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, "Gift wrapping");

        assert!(api.remove_feature("gift-wrap")?.removed);
        assert!(!api.remove_feature("gift-wrap")?.removed);
        assert!(api.list_features()?.is_empty());

        let blank = api.add_feature(AddFeatureRequest {
            key: " ".to_string(),
            name: "Blank".to_string(),
            description: String::new(),
            id: None,
        });
        assert!(blank.is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_unknown_feature_creates_cart_without_recording() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api(db_path.clone());

        let outcome = api.record_feature_use(&use_request("missing"))?;
        assert_eq!(outcome.decision, Decision::UnknownFeature);
        assert!(outcome.cart_created);
        assert!(!outcome.cart_updated);

        let cart = api.show_cart()?;
        assert_eq!(cart.version, 1);
        assert!(cart.custom_fields_raw.is_empty());

        let blank = api.record_feature_use(&use_request(""));
        assert!(matches!(
            blank.as_ref().err().and_then(|err| err.downcast_ref::<LedgerError>()),
            Some(LedgerError::Validation(_))
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_migrate_dry_run_does_not_apply() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api(db_path.clone());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.integrity_check()?.quick_check_ok);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
