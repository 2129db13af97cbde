//! Stress tests for grouptx.
//!
//! These run many processes against one service and check the
//! coordination invariants still hold under contention.

use crate::fixtures::{TestCluster, TEST_TENANT};
use grouptx_core::{CoordinatorConfig, GroomerConfig, LockOutcome, TransactionId, TxError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Tally of one stress run.
///
/// A run passes when `violations` is zero; the other counters say how much
/// contention the run actually produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StressTestResult {
    /// Allocations or commits that went through.
    pub completed: usize,
    /// Lock attempts that found the group held by another transaction.
    pub conflicts: usize,
    /// Commits rejected because the groomer expired the transaction first.
    pub expired: usize,
    /// Attempts that failed with any other error.
    pub errors: usize,
    /// Observed breaches of a coordination invariant.
    pub violations: usize,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl StressTestResult {
    /// Number of attempts made, whatever their outcome.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.completed + self.conflicts + self.expired + self.errors
    }

    /// Returns true if no coordination invariant was breached.
    #[must_use]
    pub fn holds_invariants(&self) -> bool {
        self.violations == 0
    }

    /// Adds another thread's counters to this one.
    pub fn absorb(&mut self, other: &Self) {
        self.completed += other.completed;
        self.conflicts += other.conflicts;
        self.expired += other.expired;
        self.errors += other.errors;
        self.violations += other.violations;
    }

    /// One-line verdict for the run called `name`.
    #[must_use]
    pub fn summary(&self, name: &str) -> String {
        let verdict = if self.holds_invariants() { "ok" } else { "VIOLATED" };
        format!(
            "{name}: {verdict} ({} violations); {}/{} completed, {} conflicts, {} expired, {} errors in {:?}",
            self.violations,
            self.completed,
            self.attempts(),
            self.conflicts,
            self.expired,
            self.errors,
            self.duration
        )
    }

    /// Prints [`StressTestResult::summary`].
    pub fn print_summary(&self, name: &str) {
        println!("{}", self.summary(name));
    }
}

fn join_all(handles: Vec<thread::JoinHandle<StressTestResult>>, start: Instant) -> StressTestResult {
    let mut total = StressTestResult::default();
    for handle in handles {
        total.absorb(&handle.join().expect("Thread panicked"));
    }
    total.duration = start.elapsed();
    total
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent processes.
    pub threads: usize,
    /// Number of distinct entity groups contended for.
    pub group_count: usize,
    /// Keys written per transaction.
    pub keys_per_txn: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            group_count: 4,
            keys_per_txn: 2,
        }
    }
}

/// Allocates IDs from every thread at once.
///
/// A duplicate ID, or a thread seeing its own IDs go backwards, counts as
/// a violation.
pub fn stress_concurrent_allocation(
    cluster: &TestCluster,
    config: &StressConfig,
) -> StressTestResult {
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let process = cluster.process();
            let seen = Arc::clone(&seen);
            let operations = config.operations;

            thread::spawn(move || {
                let mut tally = StressTestResult::default();
                let mut last = TransactionId::NONE;
                for _ in 0..operations {
                    match process.create_transaction_id(TEST_TENANT, false) {
                        Ok(id) => {
                            tally.completed += 1;
                            let fresh = seen.lock().expect("poisoned").insert(id);
                            if !fresh || id <= last {
                                tally.violations += 1;
                            }
                            last = id;
                        }
                        Err(_) => tally.errors += 1,
                    }
                }
                tally
            })
        })
        .collect();

    join_all(handles, start)
}

/// Runs lock-write-commit transactions over a few hot entity groups.
///
/// Each thread records the group it holds in a shared table while inside
/// the critical section; finding the group already taken by another
/// transaction is a violation. Lock conflicts count as failed operations.
pub fn stress_lock_contention(cluster: &TestCluster, config: &StressConfig) -> StressTestResult {
    let holders: Arc<Mutex<HashMap<String, TransactionId>>> = Arc::default();

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let process = cluster.process();
            let holders = Arc::clone(&holders);
            let config = config.clone();

            thread::spawn(move || {
                let mut tally = StressTestResult::default();
                for i in 0..config.operations {
                    let group = format!("Group:{}", (t + i) % config.group_count.max(1));
                    let Ok(mut txn) = process.begin(TEST_TENANT, false) else {
                        tally.errors += 1;
                        continue;
                    };
                    match txn.lock(&group) {
                        Ok(LockOutcome::Acquired | LockOutcome::AlreadyHeld) => {}
                        Ok(LockOutcome::Conflict { .. }) => {
                            tally.conflicts += 1;
                            continue;
                        }
                        Err(_) => {
                            tally.errors += 1;
                            continue;
                        }
                    }

                    let previous = holders
                        .lock()
                        .expect("poisoned")
                        .insert(group.clone(), txn.id());
                    if previous.is_some() {
                        tally.violations += 1;
                    }
                    for k in 0..config.keys_per_txn {
                        txn.record_write(&group, &format!("{group}/key{k}"))
                            .expect("Failed to record write");
                    }
                    holders.lock().expect("poisoned").remove(&group);

                    match txn.commit() {
                        Ok(_) => tally.completed += 1,
                        Err(_) => tally.errors += 1,
                    }
                }
                tally
            })
        })
        .collect();

    join_all(handles, start)
}

/// Commits transactions while a groomer with a zero lifetime tries to
/// expire every one of them.
///
/// Every transaction must end exactly one way: a successful commit that is
/// later found blacklisted, or a commit rejected as expired that is not
/// blacklisted, is a violation.
pub fn stress_commit_against_groomer(
    cluster: &TestCluster,
    config: &StressConfig,
) -> StressTestResult {
    let groomer_process = cluster
        .process_with(CoordinatorConfig::default().max_transaction_lifetime(Duration::ZERO));
    let groomer = groomer_process.groomer(GroomerConfig::default());
    let stop = Arc::new(AtomicBool::new(false));

    let groomer_thread = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let _ = groomer.run_once();
                thread::yield_now();
            }
        })
    };

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let process = cluster.process();
            let config = config.clone();

            thread::spawn(move || {
                let mut tally = StressTestResult::default();
                let mut committed = Vec::new();
                let mut expired = Vec::new();
                for i in 0..config.operations {
                    let group = format!("Group:{t}:{i}");
                    let Ok(mut txn) = process.begin(TEST_TENANT, false) else {
                        tally.errors += 1;
                        continue;
                    };
                    let written = txn
                        .lock(&group)
                        .and_then(|outcome| outcome.into_result_for(&group))
                        .and_then(|()| txn.record_write(&group, &format!("{group}/key")));
                    if let Err(e) = written {
                        match e {
                            TxError::LockConflict { .. } => tally.conflicts += 1,
                            TxError::ExpiredTransaction { .. } => tally.expired += 1,
                            _ => tally.errors += 1,
                        }
                        continue;
                    }
                    match txn.commit() {
                        Ok(_) => committed.push(txn.id()),
                        Err(TxError::ExpiredTransaction { .. }) => expired.push(txn.id()),
                        Err(_) => tally.errors += 1,
                    }
                }
                (process, tally, committed, expired)
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("Thread panicked"))
        .collect();
    stop.store(true, Ordering::Relaxed);
    groomer_thread.join().expect("Groomer thread panicked");
    let duration = start.elapsed();

    let mut total = StressTestResult::default();
    for (process, mut tally, committed, expired) in outcomes {
        tally.completed += committed.len();
        tally.expired += expired.len();
        for id in committed {
            if process.is_blacklisted(TEST_TENANT, id, None).unwrap_or(true) {
                tally.violations += 1;
            }
        }
        for id in expired {
            if !process.is_blacklisted(TEST_TENANT, id, None).unwrap_or(false) {
                tally.violations += 1;
            }
        }
        total.absorb(&tally);
    }
    total.duration = duration;
    total
}
