//! Property tests: generated workloads resolve versions like the model.

use grouptx_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn generated_workloads_stay_consistent(workload in workload_strategy(12)) {
        let mut harness = ConsistencyHarness::new(TEST_TENANT);
        harness.run(&workload);
        harness.verify_all();
        prop_assert!(harness.tracked_keys() >= 1);
    }

    #[test]
    fn any_tenant_name_round_trips(tenant in tenant_name_strategy()) {
        let cluster = TestCluster::new();
        let process = cluster.process();
        let txid = process.create_transaction_id(&tenant, false).unwrap();
        prop_assert_eq!(process.tenants().unwrap(), vec![tenant.clone()]);
        prop_assert_eq!(process.get_open_transactions(&tenant).unwrap(), vec![txid]);
    }

    #[test]
    fn lock_keys_with_separators_are_isolated(
        a in entity_group_strategy(),
        b in entity_group_strategy(),
    ) {
        prop_assume!(a != b);
        let cluster = TestCluster::new();
        let process = cluster.process();
        let first = process.create_transaction_id(TEST_TENANT, false).unwrap();
        let second = process.create_transaction_id(TEST_TENANT, false).unwrap();
        prop_assert!(process.acquire_lock(TEST_TENANT, first, &a).unwrap().is_held());
        prop_assert!(process.acquire_lock(TEST_TENANT, second, &b).unwrap().is_held());
    }
}

#[test]
fn crashed_process_is_expired_by_groomer() {
    use grouptx_core::{CoordinatorConfig, GroomerConfig};
    use std::time::Duration;

    let cluster = TestCluster::new();
    let writer = cluster.process();
    let txid = writer.create_transaction_id(TEST_TENANT, false).unwrap();
    writer.acquire_lock(TEST_TENANT, txid, "G:1").unwrap();
    writer.crash();

    let survivor =
        cluster.process_with(CoordinatorConfig::default().max_transaction_lifetime(Duration::ZERO));
    let report = survivor
        .groomer(GroomerConfig::default())
        .run_once()
        .unwrap()
        .expect("groomer lock should be free");
    assert_eq!(report.expired_transactions, 1);
    assert!(survivor.is_blacklisted(TEST_TENANT, txid, None).unwrap());
    assert!(survivor.get_open_transactions(TEST_TENANT).unwrap().is_empty());
}
