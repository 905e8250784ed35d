use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Custom-object container that holds the feature catalog.
pub const FEATURES_CONTAINER: &str = "features";
/// Cart custom field that holds the encoded used-feature list.
pub const FEATURES_FIELD_NAME: &str = "features";
/// Custom type key set on carts that record feature use.
pub const FEATURES_USED_TYPE_KEY: &str = "features-used";
pub const KEY_VALUE_DOCUMENT_TYPE_ID: &str = "key-value-document";
pub const TYPE_TYPE_ID: &str = "type";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("payload error: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Feature {
    pub id: String,
    pub key: String,
    pub name: String,
    pub description: String,
}

impl Feature {
    /// Reject features that could never be resolved or referenced.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `id` or `key` is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation("feature id must not be empty".to_string()));
        }
        if self.key.trim().is_empty() {
            return Err(LedgerError::Validation("feature key must not be empty".to_string()));
        }
        Ok(())
    }
}

/// One key-value document as returned by the custom-objects query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomObject {
    pub container: String,
    pub key: String,
    #[serde(default)]
    pub value: Value,
    pub id: String,
}

impl CustomObject {
    #[must_use]
    pub fn from_feature(feature: &Feature) -> Self {
        Self {
            container: FEATURES_CONTAINER.to_string(),
            key: feature.key.clone(),
            value: serde_json::json!({
                "name": feature.name,
                "description": feature.description,
            }),
            id: feature.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureCatalog {
    features: Vec<Feature>,
}

impl FeatureCatalog {
    #[must_use]
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// Build the catalog from custom objects, keeping only the `features` container.
    ///
    /// Missing or non-string `name`/`description` members become empty strings.
    #[must_use]
    pub fn from_custom_objects(objects: &[CustomObject]) -> Self {
        let features = objects
            .iter()
            .filter(|object| object.container == FEATURES_CONTAINER)
            .map(|object| Feature {
                id: object.id.clone(),
                key: object.key.clone(),
                name: string_member(&object.value, "name"),
                description: string_member(&object.value, "description"),
            })
            .collect();
        Self { features }
    }

    /// Resolve a feature key to its id. When several features share a key the first one wins.
    #[must_use]
    pub fn lookup_id(&self, key: &str) -> Option<&str> {
        self.features.iter().find(|feature| feature.key == key).map(|feature| feature.id.as_str())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.id == id)
    }

    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn string_member(value: &Value, member: &str) -> String {
    value.get(member).and_then(Value::as_str).unwrap_or_default().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomFieldRaw {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cart {
    pub id: String,
    pub version: i64,
    pub currency: String,
    pub country: Option<String>,
    pub custom_type_key: Option<String>,
    #[serde(default)]
    pub custom_fields_raw: Vec<CustomFieldRaw>,
}

impl Cart {
    #[must_use]
    pub fn custom_field(&self, name: &str) -> Option<&CustomFieldRaw> {
        self.custom_fields_raw.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Address {
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartDraft {
    pub currency: String,
    pub country: String,
    pub shipping_address: Address,
}

/// Currency and country used when a cart has to be created for the shopper.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShopperContext {
    pub currency: String,
    pub country: String,
}

impl ShopperContext {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when currency or country is blank.
    pub fn new(currency: impl Into<String>, country: impl Into<String>) -> Result<Self, LedgerError> {
        let context = Self { currency: currency.into(), country: country.into() };
        if context.currency.trim().is_empty() {
            return Err(LedgerError::Validation("currency must not be empty".to_string()));
        }
        if context.country.trim().is_empty() {
            return Err(LedgerError::Validation("country must not be empty".to_string()));
        }
        Ok(context)
    }

    #[must_use]
    pub fn cart_draft(&self) -> CartDraft {
        CartDraft {
            currency: self.currency.clone(),
            country: self.country.clone(),
            shipping_address: Address { country: self.country.clone() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureReference {
    #[serde(rename = "typeId")]
    pub type_id: String,
    pub id: String,
}

impl FeatureReference {
    #[must_use]
    pub fn key_value_document(id: impl Into<String>) -> Self {
        Self { type_id: KEY_VALUE_DOCUMENT_TYPE_ID.to_string(), id: id.into() }
    }
}

/// JSON array of [`FeatureReference`]s, serialized to a string for the `features` field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct EncodedPayload(String);

impl EncodedPayload {
    /// # Errors
    /// Returns [`LedgerError::Payload`] when the reference list cannot be serialized.
    pub fn encode<'a, I>(ids: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let references =
            ids.into_iter().map(FeatureReference::key_value_document).collect::<Vec<_>>();
        serde_json::to_string(&references)
            .map(Self)
            .map_err(|err| LedgerError::Payload(format!("failed to encode feature list: {err}")))
    }

    /// # Errors
    /// Returns [`LedgerError::Payload`] when the string is not a JSON reference list.
    pub fn decode(&self) -> Result<Vec<FeatureReference>, LedgerError> {
        serde_json::from_str(&self.0)
            .map_err(|err| LedgerError::Payload(format!("failed to decode feature list: {err}")))
    }

    /// # Errors
    /// Returns [`LedgerError::Payload`] when the string is not a JSON reference list.
    pub fn feature_ids(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self.decode()?.into_iter().map(|reference| reference.id).collect())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for EncodedPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TypeResourceIdentifier {
    pub key: String,
    #[serde(rename = "typeId")]
    pub type_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CustomFieldInput {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SetCustomType {
    #[serde(rename = "type")]
    pub type_ref: TypeResourceIdentifier,
    pub fields: CustomFieldInput,
}

/// Cart update action in the shape the cart-update mutation accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdateAction {
    pub set_custom_type: SetCustomType,
}

impl CartUpdateAction {
    #[must_use]
    pub fn record_features(payload: &EncodedPayload) -> Self {
        Self {
            set_custom_type: SetCustomType {
                type_ref: TypeResourceIdentifier {
                    key: FEATURES_USED_TYPE_KEY.to_string(),
                    type_id: TYPE_TYPE_ID.to_string(),
                },
                fields: CustomFieldInput {
                    name: FEATURES_FIELD_NAME.to_string(),
                    value: payload.as_str().to_string(),
                },
            },
        }
    }
}

/// Feature ids recorded on a cart, in stored order and without duplicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UsedFeatureSet {
    ids: Vec<String>,
    #[serde(skip)]
    skipped_entries: usize,
}

impl UsedFeatureSet {
    /// Read the `features` custom field of the cart.
    ///
    /// An absent cart or field yields an empty set. A value that is not a list counts as one
    /// skipped entry, as does every list entry without a string `id`.
    #[must_use]
    pub fn ids_of(cart: Option<&Cart>) -> Self {
        cart.and_then(|cart| cart.custom_field(FEATURES_FIELD_NAME))
            .map(|field| Self::from_field_value(&field.value))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn from_field_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::default(),
            Value::Array(entries) => Self::from_entries(entries),
            // Some backends hand JSON-typed fields back in their string form.
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(entries)) => Self::from_entries(&entries),
                _ => Self { ids: Vec::new(), skipped_entries: 1 },
            },
            _ => Self { ids: Vec::new(), skipped_entries: 1 },
        }
    }

    fn from_entries(entries: &[Value]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            match entry.get("id").and_then(Value::as_str) {
                Some(id) => set.insert(id),
                None => set.skipped_entries += 1,
            }
        }
        set
    }

    fn insert(&mut self, id: &str) {
        if !self.contains(id) {
            self.ids.push(id.to_string());
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Copy of this set with `id` appended last, unless already present.
    #[must_use]
    pub fn with_appended(&self, id: &str) -> Self {
        let mut next = Self { ids: self.ids.clone(), skipped_entries: 0 };
        next.insert(id);
        next
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of entries ignored while reading the stored value.
    #[must_use]
    pub fn skipped_entries(&self) -> usize {
        self.skipped_entries
    }

    /// Display projection of the used ids, in catalog order. Ids unknown to the catalog are dropped.
    #[must_use]
    pub fn names_of(&self, catalog: &FeatureCatalog) -> Vec<UsedFeatureName> {
        catalog
            .features()
            .iter()
            .filter(|feature| self.contains(&feature.id))
            .map(|feature| UsedFeatureName {
                id: feature.id.clone(),
                name: feature.name.clone(),
                description: feature.description.clone(),
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for UsedFeatureSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = Self::default();
        for id in iter {
            set.insert(&id.into());
        }
        set
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UsedFeatureName {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Reconciliation {
    UnknownFeature { key: String },
    AlreadyRecorded { feature_id: String },
    Append { feature_id: String, used: UsedFeatureSet, payload: EncodedPayload },
}

/// Outcome of one feature use, as reported to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Recorded,
    AlreadyRecorded,
    UnknownFeature,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::AlreadyRecorded => "already_recorded",
            Self::UnknownFeature => "unknown_feature",
        }
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Reconciliation {
    #[must_use]
    pub fn decision(&self) -> Decision {
        match self {
            Self::UnknownFeature { .. } => Decision::UnknownFeature,
            Self::AlreadyRecorded { .. } => Decision::AlreadyRecorded,
            Self::Append { .. } => Decision::Recorded,
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&EncodedPayload> {
        match self {
            Self::Append { payload, .. } => Some(payload),
            Self::UnknownFeature { .. } | Self::AlreadyRecorded { .. } => None,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> Option<EncodedPayload> {
        match self {
            Self::Append { payload, .. } => Some(payload),
            Self::UnknownFeature { .. } | Self::AlreadyRecorded { .. } => None,
        }
    }
}

/// Decide whether using `feature_key` has to be persisted, and why.
///
/// Unknown keys are a no-op. A feature already in `used` is never written twice, and an
/// appended id always lands after every id already recorded.
///
/// # Errors
/// Returns [`LedgerError::Payload`] when the new reference list cannot be encoded.
pub fn reconcile(
    catalog: &FeatureCatalog,
    used: &UsedFeatureSet,
    feature_key: &str,
) -> Result<Reconciliation, LedgerError> {
    let Some(feature_id) = catalog.lookup_id(feature_key) else {
        return Ok(Reconciliation::UnknownFeature { key: feature_key.to_string() });
    };

    if used.contains(feature_id) {
        return Ok(Reconciliation::AlreadyRecorded { feature_id: feature_id.to_string() });
    }

    let next = used.with_appended(feature_id);
    let payload = EncodedPayload::encode(next.ids().iter().map(String::as_str))?;
    Ok(Reconciliation::Append { feature_id: feature_id.to_string(), used: next, payload })
}

/// Payload to persist after using `feature_key`, or `None` when nothing has to be written.
///
/// # Errors
/// Returns [`LedgerError::Payload`] when the new reference list cannot be encoded.
pub fn compute_update(
    catalog: &FeatureCatalog,
    used: &UsedFeatureSet,
    feature_key: &str,
) -> Result<Option<EncodedPayload>, LedgerError> {
    Ok(reconcile(catalog, used, feature_key)?.into_payload())
}
