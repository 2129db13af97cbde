//! Simulate command implementation.
//!
//! Every writer is a separate session on one in-process service, so lock
//! contention, crashes and grooming behave as they would across servers.

use grouptx_coord::{CoordinationClient, InMemoryCoordinator, InMemorySession};
use grouptx_core::{
    Coordinator, CoordinatorConfig, GroomReport, Groomer, GroomerConfig, LockOutcome, TxResult,
};
use rand::seq::index::sample;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct Options {
    /// Tenant all writers use.
    pub tenant: String,
    /// Writer processes.
    pub writers: usize,
    /// Transactions per writer.
    pub transactions: usize,
    /// Entity groups contended for.
    pub groups: usize,
    /// Probability a transaction's process crashes after locking.
    pub crash_rate: f64,
    /// Probability a transaction is cross-group.
    pub xg_rate: f64,
}

/// What the writers did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WriterStats {
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back by the writer.
    pub aborted: usize,
    /// Transactions abandoned after a lock conflict.
    pub conflicts: usize,
    /// Transactions left behind by a crashed process.
    pub crashed: usize,
    /// Transactions that failed with an error.
    pub failed: usize,
}

impl WriterStats {
    fn merge(&mut self, other: &WriterStats) {
        self.committed += other.committed;
        self.aborted += other.aborted;
        self.conflicts += other.conflicts;
        self.crashed += other.crashed;
        self.failed += other.failed;
    }
}

/// Simulation summary.
#[derive(Debug, Serialize)]
pub struct SimulationStats {
    /// Totals over every writer.
    pub writers: WriterStats,
    /// Report of the grooming pass run after the writers finished.
    pub groom: Option<GroomReport>,
    /// Transactions still open after grooming.
    pub open_after_groom: usize,
    /// Lock nodes left after grooming.
    pub locks_after_groom: usize,
    /// Blacklist size after grooming.
    pub blacklisted: usize,
    /// Wall time of the writer phase.
    pub elapsed_ms: u128,
}

/// Runs the simulate command.
pub fn run(options: &Options, dump: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if options.groups == 0 {
        return Err("at least one entity group is required".into());
    }
    let service = InMemoryCoordinator::new();

    let start = Instant::now();
    let handles: Vec<_> = (0..options.writers)
        .map(|writer| {
            let service = service.clone();
            let options = options.clone();
            thread::spawn(move || run_writer(writer, &service, &options))
        })
        .collect();

    let mut totals = WriterStats::default();
    for handle in handles {
        let stats = handle.join().map_err(|_| "writer thread panicked")?;
        totals.merge(&stats);
    }
    let elapsed = start.elapsed();

    // Anything still open now belongs to a crashed process.
    let groomer_process = Arc::new(Coordinator::new(
        Arc::new(service.connect()),
        CoordinatorConfig::default().max_transaction_lifetime(Duration::ZERO),
    ));
    let groomer = Groomer::new(Arc::clone(&groomer_process), GroomerConfig::default());
    let groom = groomer.run_once()?;

    let tenant = groomer_process.tenant(&options.tenant)?;
    let stats = SimulationStats {
        writers: totals,
        groom,
        open_after_groom: tenant.allocator().get_open_transactions()?.len(),
        locks_after_groom: tenant.locks().locks()?.len(),
        blacklisted: tenant.blacklist().entries()?.len(),
        elapsed_ms: elapsed.as_millis(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
        _ => print_text(options, &stats),
    }
    if dump {
        print_tree(&service);
    }
    Ok(())
}

fn run_writer(writer: usize, service: &InMemoryCoordinator, options: &Options) -> WriterStats {
    let session = Arc::new(service.connect());
    let coordinator = Coordinator::new(
        Arc::clone(&session) as Arc<dyn CoordinationClient>,
        CoordinatorConfig::default(),
    );
    let mut rng = rand::thread_rng();
    let mut stats = WriterStats::default();

    for n in 0..options.transactions {
        let xg = options.groups > 1 && rng.gen_bool(options.xg_rate.clamp(0.0, 1.0));
        let width = if xg {
            rng.gen_range(2..=options.groups.min(coordinator.config().max_groups_per_xg.max(2)))
        } else {
            1
        };
        let groups: Vec<String> = sample(&mut rng, options.groups, width)
            .into_iter()
            .map(|g| format!("Group:{g}"))
            .collect();

        let result = if rng.gen_bool(options.crash_rate.clamp(0.0, 1.0)) {
            crash_mid_transaction(&coordinator, service, &session, options, &groups, xg)
                .map(|()| stats.crashed += 1)
        } else {
            run_transaction(&coordinator, options, &groups, xg, n, &mut rng, &mut stats)
        };
        if let Err(e) = result {
            debug!(writer, error = %e, "transaction failed");
            stats.failed += 1;
        }
    }
    stats
}

fn run_transaction(
    coordinator: &Coordinator,
    options: &Options,
    groups: &[String],
    xg: bool,
    n: usize,
    rng: &mut impl Rng,
    stats: &mut WriterStats,
) -> TxResult<()> {
    let mut txn = coordinator.begin(&options.tenant, xg)?;
    for group in groups {
        if let LockOutcome::Conflict { holder } = txn.lock(group)? {
            debug!(txid = %txn.id(), %holder, group, "lock conflict");
            txn.abort()?;
            stats.conflicts += 1;
            return Ok(());
        }
        txn.record_write(group, &format!("{group}/Entity:{}", n % 16))?;
    }

    if rng.gen_bool(0.1) {
        txn.abort()?;
        stats.aborted += 1;
    } else {
        txn.commit()?;
        stats.committed += 1;
    }
    Ok(())
}

/// Takes locks through the façade, then expires the session without
/// finishing, the way a dying process would.
fn crash_mid_transaction(
    coordinator: &Coordinator,
    service: &InMemoryCoordinator,
    session: &InMemorySession,
    options: &Options,
    groups: &[String],
    xg: bool,
) -> TxResult<()> {
    let txid = coordinator.create_transaction_id(&options.tenant, xg)?;
    for group in groups {
        if !coordinator.acquire_lock(&options.tenant, txid, group)?.is_held() {
            break;
        }
    }
    service.expire_session(session.session_id());
    if let Err(e) = session.reconnect() {
        warn!(error = %e, "reconnect after simulated crash failed");
        return Err(e.into());
    }
    debug!(%txid, "simulated crash");
    Ok(())
}

fn print_text(options: &Options, stats: &SimulationStats) {
    println!(
        "Simulated {} writers x {} transactions over {} groups in {} ms",
        options.writers, options.transactions, options.groups, stats.elapsed_ms
    );
    println!();
    println!("Writers:");
    println!("  Committed:  {}", stats.writers.committed);
    println!("  Aborted:    {}", stats.writers.aborted);
    println!("  Conflicts:  {}", stats.writers.conflicts);
    println!("  Crashed:    {}", stats.writers.crashed);
    println!("  Failed:     {}", stats.writers.failed);
    println!();
    match &stats.groom {
        Some(report) => println!("Groomer: {}", report),
        None => println!("Groomer: lock held elsewhere, pass skipped"),
    }
    println!("  Open transactions left: {}", stats.open_after_groom);
    println!("  Locks left:             {}", stats.locks_after_groom);
    println!("  Blacklisted:            {}", stats.blacklisted);
}

fn print_tree(service: &InMemoryCoordinator) {
    println!();
    for (path, data) in service.dump() {
        let depth = path.matches('/').count().saturating_sub(1);
        let name = path.rsplit('/').next().unwrap_or(&path);
        let name = if name.is_empty() { "/" } else { name };
        if data.is_empty() {
            println!("{:indent$}{}", "", name, indent = depth * 2);
        } else {
            println!(
                "{:indent$}{} = {}",
                "",
                name,
                String::from_utf8_lossy(&data),
                indent = depth * 2
            );
        }
    }
}
