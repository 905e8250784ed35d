//! Feature-use recording against a cart backend.
//!
//! [`CartSynchronizer`] makes sure the shopper has a cart, reconciles the requested feature
//! against the ids already stored on it, and writes the new list only when it changed.

use anyhow::{Context, Result};
use feature_ledger_core::{
    reconcile, Cart, CartDraft, CartUpdateAction, CustomObject, Decision, FeatureCatalog,
    Reconciliation,
    ShopperContext, UsedFeatureName, UsedFeatureSet, FEATURES_CONTAINER,
};
use feature_ledger_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};

/// Source of key-value documents, queried by container.
pub trait CatalogService {
    /// # Errors
    /// Returns an error when the backend cannot be queried.
    fn custom_objects(&self, container: &str) -> Result<Vec<CustomObject>>;
}

/// Read, create and update access to the shopper's active cart.
pub trait CartService {
    /// # Errors
    /// Returns an error when the backend cannot be queried.
    fn active_cart(&self) -> Result<Option<Cart>>;

    /// # Errors
    /// Returns an error when the cart cannot be created.
    fn create_cart(&mut self, draft: &CartDraft) -> Result<Cart>;

    /// # Errors
    /// Returns an error when the update cannot be applied.
    fn update_cart(&mut self, cart: &Cart, action: &CartUpdateAction) -> Result<Cart>;
}

impl CatalogService for SqliteStore {
    fn custom_objects(&self, container: &str) -> Result<Vec<CustomObject>> {
        SqliteStore::custom_objects(self, container)
    }
}

impl CartService for SqliteStore {
    fn active_cart(&self) -> Result<Option<Cart>> {
        SqliteStore::active_cart(self)
    }

    fn create_cart(&mut self, draft: &CartDraft) -> Result<Cart> {
        SqliteStore::create_cart(self, draft)
    }

    fn update_cart(&mut self, cart: &Cart, action: &CartUpdateAction) -> Result<Cart> {
        self.set_custom_type(&cart.id, &action.set_custom_type)
    }
}

/// Fetch the feature catalog from the `features` container.
///
/// # Errors
/// Returns an error when the catalog service fails.
pub fn load_catalog<S: CatalogService + ?Sized>(service: &S) -> Result<FeatureCatalog> {
    let objects =
        service.custom_objects(FEATURES_CONTAINER).context("failed to load feature catalog")?;
    Ok(FeatureCatalog::from_custom_objects(&objects))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureUseOutcome {
    pub feature_key: String,
    pub decision: Decision,
    pub feature_id: Option<String>,
    pub cart_id: String,
    pub cart_created: bool,
    pub cart_updated: bool,
    pub used_feature_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsedFeaturesView {
    pub cart_id: Option<String>,
    pub used_feature_ids: Vec<String>,
    pub features: Vec<UsedFeatureName>,
}

pub struct CartSynchronizer<C> {
    carts: C,
    catalog: FeatureCatalog,
    shopper: ShopperContext,
}

impl<C: CartService> CartSynchronizer<C> {
    #[must_use]
    pub fn new(carts: C, catalog: FeatureCatalog, shopper: ShopperContext) -> Self {
        Self { carts, catalog, shopper }
    }

    #[must_use]
    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn carts(&self) -> &C {
        &self.carts
    }

    #[must_use]
    pub fn into_carts(self) -> C {
        self.carts
    }

    /// Record that the shopper used the feature behind `feature_key`.
    ///
    /// Creates a cart first when none is active. At most one create call and one update call
    /// reach the cart service, in that order.
    ///
    /// # Errors
    /// Returns an error when a cart service call fails or the payload cannot be encoded.
    /// A failed update after a successful create leaves the new cart without the feature;
    /// calling again is safe.
    pub fn record_feature_use(&mut self, feature_key: &str) -> Result<FeatureUseOutcome> {
        let (cart, cart_created) = match self.carts.active_cart()? {
            Some(cart) => (cart, false),
            None => {
                let draft = self.shopper.cart_draft();
                let cart = self.carts.create_cart(&draft).context("failed to create cart")?;
                tracing::info!(
                    cart_id = %cart.id,
                    currency = %draft.currency,
                    country = %draft.country,
                    "created cart before recording feature use"
                );
                (cart, true)
            }
        };

        let used = UsedFeatureSet::ids_of(Some(&cart));
        if used.skipped_entries() > 0 {
            tracing::warn!(
                cart_id = %cart.id,
                skipped = used.skipped_entries(),
                "ignored malformed entries in features custom field"
            );
        }

        let reconciliation = reconcile(&self.catalog, &used, feature_key)?;
        let decision = reconciliation.decision();
        let outcome = match reconciliation {
            Reconciliation::UnknownFeature { .. } => {
                tracing::warn!(feature_key, "feature key not found in catalog; nothing recorded");
                FeatureUseOutcome {
                    feature_key: feature_key.to_string(),
                    decision,
                    feature_id: None,
                    cart_id: cart.id,
                    cart_created,
                    cart_updated: false,
                    used_feature_ids: used.ids().to_vec(),
                }
            }
            Reconciliation::AlreadyRecorded { feature_id } => {
                tracing::debug!(feature_key, %feature_id, "feature already recorded on cart");
                FeatureUseOutcome {
                    feature_key: feature_key.to_string(),
                    decision,
                    feature_id: Some(feature_id),
                    cart_id: cart.id,
                    cart_created,
                    cart_updated: false,
                    used_feature_ids: used.ids().to_vec(),
                }
            }
            Reconciliation::Append { feature_id, used: next, payload } => {
                let action = CartUpdateAction::record_features(&payload);
                let updated = self
                    .carts
                    .update_cart(&cart, &action)
                    .with_context(|| format!("failed to record feature {feature_key} on cart"))?;
                tracing::info!(
                    cart_id = %updated.id,
                    feature_key,
                    %feature_id,
                    used = next.len(),
                    "recorded feature use"
                );
                FeatureUseOutcome {
                    feature_key: feature_key.to_string(),
                    decision,
                    feature_id: Some(feature_id),
                    cart_id: updated.id,
                    cart_created,
                    cart_updated: true,
                    used_feature_ids: next.ids().to_vec(),
                }
            }
        };
        Ok(outcome)
    }

    /// Display projection of the features recorded on the active cart.
    ///
    /// # Errors
    /// Returns an error when the active cart cannot be read.
    pub fn used_features(&self) -> Result<UsedFeaturesView> {
        let cart = self.carts.active_cart()?;
        let used = UsedFeatureSet::ids_of(cart.as_ref());
        Ok(UsedFeaturesView {
            cart_id: cart.map(|cart| cart.id),
            features: used.names_of(&self.catalog),
            used_feature_ids: used.ids().to_vec(),
        })
    }
}
