use criterion::{criterion_group, criterion_main, Criterion};
use feature_ledger_core::{
    compute_update, Cart, CustomFieldRaw, EncodedPayload, Feature, FeatureCatalog,
    UsedFeatureSet, FEATURES_FIELD_NAME, FEATURES_USED_TYPE_KEY,
};

fn mk_feature(index: usize) -> Feature {
    Feature {
        id: format!("feature-{index:05}"),
        key: format!("key-{index:05}"),
        name: format!("Feature {index}"),
        description: "benchmark fixture".to_string(),
    }
}

fn mk_cart(used: &[String]) -> Cart {
    let payload = EncodedPayload::encode(used.iter().map(String::as_str))
        .unwrap_or_else(|err| panic!("failed to encode benchmark payload: {err}"));
    let value = serde_json::from_str(payload.as_str())
        .unwrap_or_else(|err| panic!("benchmark payload is not JSON: {err}"));
    Cart {
        id: "bench-cart".to_string(),
        version: 1,
        currency: "EUR".to_string(),
        country: Some("DE".to_string()),
        custom_type_key: Some(FEATURES_USED_TYPE_KEY.to_string()),
        custom_fields_raw: vec![CustomFieldRaw { name: FEATURES_FIELD_NAME.to_string(), value }],
    }
}

fn bench_reconcile(c: &mut Criterion) {
    let catalog = FeatureCatalog::new((0..2_000).map(mk_feature).collect());
    let used_ids = (0..500).map(|index| format!("feature-{index:05}")).collect::<Vec<_>>();
    let cart = mk_cart(&used_ids);

    c.bench_function("ids_of_500_entries", |b| {
        b.iter(|| {
            let used = UsedFeatureSet::ids_of(Some(&cart));
            assert_eq!(used.len(), 500);
        });
    });

    let used = UsedFeatureSet::ids_of(Some(&cart));
    c.bench_function("compute_update_append_2000_catalog", |b| {
        b.iter(|| {
            let result = compute_update(&catalog, &used, "key-01999");
            assert!(matches!(result, Ok(Some(_))));
        });
    });

    c.bench_function("compute_update_already_recorded", |b| {
        b.iter(|| {
            let result = compute_update(&catalog, &used, "key-00250");
            assert!(matches!(result, Ok(None)));
        });
    });
}

criterion_group!(benches, bench_reconcile);
criterion_main!(benches);
