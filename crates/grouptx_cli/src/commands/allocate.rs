//! Allocate command implementation.

use grouptx_coord::InMemoryCoordinator;
use grouptx_core::{Coordinator, CoordinatorConfig, BUCKET_SPAN};
use std::sync::Arc;

/// Runs the allocate command.
pub fn run(
    tenant: &str,
    count: usize,
    near_rollover: Option<u32>,
    offset: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = InMemoryCoordinator::new();
    let coordinator = Coordinator::new(Arc::new(service.connect()), CoordinatorConfig::default());

    if let Some(offset) = offset {
        coordinator.set_manual_offset(tenant, offset)?;
        println!("Manual offset: {}", offset);
    }

    if let Some(remaining) = near_rollover {
        // The bucket has to exist before its counter can be moved.
        let probe = coordinator.create_transaction_id(tenant, false)?;
        coordinator.delete_transaction_id(tenant, probe)?;

        let next = (i64::from(i32::MAX) - i64::from(remaining.max(1)) + 1).max(0);
        let bucket = coordinator.tenant(tenant)?.paths().bucket_dir(0);
        service.set_next_sequence(&bucket, i32::try_from(next)?)?;
        println!("Counter moved {} IDs before rollover", remaining.max(1));
    }

    println!("Allocating {} IDs for tenant {:?}", count, tenant);
    println!();
    let tenant_state = coordinator.tenant(tenant)?;
    let allocator = tenant_state.allocator();
    for _ in 0..count {
        let txid = allocator.create_transaction_id(false)?;
        let node = allocator.counter_path(txid)?;
        let bucket = txid.as_u64().saturating_sub(allocator.offset()) / BUCKET_SPAN;
        println!("  {:<16} bucket {:<3} {}", txid.to_string(), bucket, node);
    }

    Ok(())
}
