//! A secret already on the target always wins over generation.

use berth_core::fakes::{test_config, CountingGenerator, FakeTarget};
use berth_core::{CredentialResolver, CredentialSlot, CredentialStore, Provenance};

#[tokio::test]
async fn test_existing_secret_is_recovered_not_generated() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let target = FakeTarget::for_config(&config);
    let slot = CredentialSlot::gateway(&config);
    let existing = "Q".repeat(48);
    target.set_file(&slot.path, &format!("{}={existing}\n", slot.key));

    let store = CredentialStore::for_config(&config);
    let generator = CountingGenerator::default();
    let resolved = CredentialResolver::new(&target, &store, &generator)
        .resolve("test", FakeTarget::ADDRESS, &slot, false)
        .await
        .unwrap();

    assert_eq!(resolved.record.secret, existing);
    assert_eq!(resolved.record.provenance, Provenance::RecoveredFromTarget);
    assert_eq!(generator.calls(), 0);
    assert_eq!(target.mutating_execs(), 0);
    assert_eq!(store.load("gateway").unwrap().unwrap().secret, existing);
}

#[tokio::test]
async fn test_malformed_secret_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let target = FakeTarget::for_config(&config);
    let slot = CredentialSlot::gateway(&config);
    target.set_file(&slot.path, &format!("{}=changeme\n", slot.key));

    let store = CredentialStore::for_config(&config);
    let generator = CountingGenerator::default();
    let resolved = CredentialResolver::new(&target, &store, &generator)
        .resolve("test", FakeTarget::ADDRESS, &slot, false)
        .await
        .unwrap();

    assert_eq!(resolved.record.provenance, Provenance::NewlyGenerated);
    assert_eq!(
        target.env_value(&slot.path, &slot.key).as_deref(),
        Some(resolved.record.secret.as_str())
    );
}
