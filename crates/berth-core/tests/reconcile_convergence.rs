//! Drift is repaired without a redeploy.

use berth_core::catalog;
use berth_core::fakes::{test_config, CountingGenerator, FakeCloud, FakeTarget};
use berth_core::{DeployOptions, Engine, FactCatalog, Reconciler, VerdictStatus};

async fn deployed() -> (tempfile::TempDir, berth_core::Config, FakeCloud, FakeTarget) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cloud = FakeCloud::new();
    let target = FakeTarget::for_config(&config);
    let generator = CountingGenerator::default();
    Engine::new(&config, &cloud, &target, &generator)
        .deploy(DeployOptions::default())
        .await
        .unwrap();
    (dir, config, cloud, target)
}

#[tokio::test]
async fn test_one_drifted_fact_is_fixed_once() {
    let (_dir, config, _cloud, target) = deployed().await;
    target.stop_service(&config.gateway.service);
    let catalog = FactCatalog::from_config(&config);
    let reconciler = Reconciler::new(&target, &catalog);

    let fixed = reconciler.reconcile_all(FakeTarget::ADDRESS, true).await.unwrap();
    assert_eq!(fixed.fixed_count(), 1);
    assert_eq!(
        fixed.get(catalog::GATEWAY_ACTIVE).unwrap().status,
        VerdictStatus::Fixed
    );
    assert_eq!(fixed.fail_count(), 0);

    let recheck = reconciler.reconcile_all(FakeTarget::ADDRESS, false).await.unwrap();
    assert_eq!(recheck.fail_count(), 0);
    assert_eq!(recheck.fixed_count(), 0);
    assert_eq!(recheck.exit_code(), 0);
}

#[tokio::test]
async fn test_drift_without_fix_drives_exit_code() {
    let (_dir, config, _cloud, target) = deployed().await;
    target.stop_service(&config.gateway.service);
    let catalog = FactCatalog::from_config(&config);

    let report = Reconciler::new(&target, &catalog)
        .reconcile_all(FakeTarget::ADDRESS, false)
        .await
        .unwrap();
    assert_eq!(report.failing(), vec![catalog::GATEWAY_ACTIVE.to_string()]);
    assert_eq!(report.exit_code(), 1);
    let verdict = report.get(catalog::GATEWAY_ACTIVE).unwrap();
    assert!(!verdict.remediation_applied);
    assert!(verdict.detail.contains("--fix"));
}

#[tokio::test]
async fn test_audit_fix_through_engine() {
    let (_dir, config, cloud, target) = deployed().await;
    target.disable_firewall();
    let generator = CountingGenerator::default();
    let engine = Engine::new(&config, &cloud, &target, &generator);

    let summary = engine.audit(true).await.unwrap();
    assert_eq!(summary.report.fixed_count(), 1);
    assert_eq!(
        summary.report.get(catalog::FIREWALL_ACTIVE).unwrap().status,
        VerdictStatus::Fixed
    );
}
