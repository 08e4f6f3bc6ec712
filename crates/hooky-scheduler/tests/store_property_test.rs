//! Property-based tests for the task store contract.
//!
//! Runs against the in-memory store, which shares its semantics with the
//! PostgreSQL store, so these invariants describe both.

use std::{collections::HashSet, sync::Arc, time::Duration};

use hooky_core::{Clock, Completion, OwnerId, Task, TaskStatus};
use hooky_scheduler::{
    client::build_attempt, storage::mock::MockTaskStore, DispatchResponse, TaskStore,
};
use hooky_testing::{TaskBuilder, TestClock};
use proptest::prelude::*;

const LEASE: Duration = Duration::from_secs(30);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime")
}

async fn seed(store: &MockTaskStore, clock: &TestClock, offsets_secs: &[i64]) -> Vec<Task> {
    let now = clock.now_utc();
    let mut tasks = Vec::with_capacity(offsets_secs.len());
    for offset in offsets_secs {
        let task = TaskBuilder::new().run_at(now + chrono::Duration::seconds(*offset)).build(now);
        store.insert_task(task.clone()).await;
        tasks.push(task);
    }
    tasks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Concurrent reservations never hand the same task to two owners.
    #[test]
    fn concurrent_reservations_are_disjoint(
        task_count in 1usize..40,
        limits in prop::collection::vec(1usize..10, 2..6),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let clock = TestClock::new();
            let store = MockTaskStore::new(Arc::new(clock.clone()));
            seed(&store, &clock, &vec![-1; task_count]).await;

            let mut handles = Vec::new();
            for limit in &limits {
                let store = store.clone();
                let limit = *limit;
                handles.push(tokio::spawn(async move {
                    let owner = OwnerId::new();
                    let claimed = store.reserve(limit, owner, LEASE).await.expect("reserve");
                    (owner, limit, claimed)
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for handle in handles {
                let (owner, limit, claimed) = handle.await.expect("join");
                prop_assert!(claimed.len() <= limit);
                for task in claimed {
                    prop_assert!(seen.insert(task.id), "task {} claimed twice", task.id);
                    prop_assert_eq!(task.reserved_by, Some(owner));
                    prop_assert_eq!(task.status, TaskStatus::Reserved);
                    total += 1;
                }
            }
            prop_assert_eq!(total, task_count.min(limits.iter().sum()));

            for task in store.tasks().await {
                let reserved = task.status == TaskStatus::Reserved;
                prop_assert_eq!(reserved, seen.contains(&task.id));
                prop_assert_eq!(reserved, task.reserved_by.is_some());
                prop_assert_eq!(reserved, task.reserved_until.is_some());
            }
            Ok(())
        })?;
    }

    /// Only due tasks are claimed, earliest `run_at` first.
    #[test]
    fn reserve_claims_due_tasks_in_order(
        offsets in prop::collection::vec(-600i64..600, 1..30),
        limit in 1usize..40,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let clock = TestClock::new();
            let store = MockTaskStore::new(Arc::new(clock.clone()));
            let tasks = seed(&store, &clock, &offsets).await;
            let now = clock.now_utc();

            let claimed = store.reserve(limit, OwnerId::new(), LEASE).await.expect("reserve");

            let due = tasks.iter().filter(|task| task.run_at <= now).count();
            prop_assert_eq!(claimed.len(), due.min(limit));
            prop_assert!(claimed.iter().all(|task| task.run_at <= now));
            prop_assert!(claimed.windows(2).all(|w| (w[0].run_at, w[0].id) <= (w[1].run_at, w[1].id)));

            // Nothing left unclaimed may be due earlier than the last claimed task.
            if let Some(last) = claimed.last() {
                let claimed_ids: HashSet<_> = claimed.iter().map(|task| task.id).collect();
                for task in tasks.iter().filter(|task| !claimed_ids.contains(&task.id)) {
                    prop_assert!(task.run_at > now || (task.run_at, task.id) > (last.run_at, last.id));
                }
            }
            Ok(())
        })?;
    }

    /// A lease is exclusive until it expires, then reclaimable by anyone, and
    /// the previous owner can no longer complete.
    #[test]
    fn expired_leases_are_reclaimed(task_count in 1usize..10, early_secs in 0u64..30) {
        let rt = runtime();
        rt.block_on(async {
            let clock = TestClock::new();
            let store = MockTaskStore::new(Arc::new(clock.clone()));
            seed(&store, &clock, &vec![0; task_count]).await;
            let first = OwnerId::new();
            let second = OwnerId::new();

            let held = store.reserve(task_count, first, LEASE).await.expect("reserve");
            prop_assert_eq!(held.len(), task_count);

            clock.advance(Duration::from_secs(early_secs));
            prop_assert!(store.reserve(task_count, second, LEASE).await.expect("reserve").is_empty());

            clock.advance(LEASE - Duration::from_secs(early_secs) + Duration::from_millis(1));
            let reclaimed = store.reserve(task_count, second, LEASE).await.expect("reserve");
            prop_assert_eq!(reclaimed.len(), task_count);

            for task in &held {
                let applied = store.complete(task.id, first, Completion::Finished).await.expect("complete");
                prop_assert!(!applied);
                prop_assert!(!store.release(task.id, first).await.expect("release"));
            }
            for task in &reclaimed {
                prop_assert!(task.is_reserved_by(second));
            }
            Ok(())
        })?;
    }

    /// `touch` extends exactly the caller's leases.
    #[test]
    fn touch_extends_only_own_leases(mine in 0usize..10, theirs in 1usize..10, after_secs in 1u64..29) {
        let rt = runtime();
        rt.block_on(async {
            let clock = TestClock::new();
            let store = MockTaskStore::new(Arc::new(clock.clone()));
            seed(&store, &clock, &vec![0; mine + theirs]).await;
            let me = OwnerId::new();
            let them = OwnerId::new();
            store.reserve(mine, me, LEASE).await.expect("reserve");
            let their_tasks = store.reserve(theirs, them, LEASE).await.expect("reserve");

            clock.advance(Duration::from_secs(after_secs));
            let touched = store.touch(me, LEASE).await.expect("touch");
            prop_assert_eq!(touched, mine as u64);

            let extended_until = clock.now_utc() + chrono::Duration::seconds(30);
            for task in store.tasks().await {
                if task.is_reserved_by(me) {
                    prop_assert_eq!(task.reserved_until, Some(extended_until));
                }
            }
            for task in &their_tasks {
                let stored = store.find_task(task.id).await.expect("find").expect("exists");
                prop_assert_eq!(stored.reserved_until, task.reserved_until);
            }

            // Past the original expiry only the untouched leases are reclaimable.
            clock.advance(LEASE - Duration::from_secs(after_secs) + Duration::from_millis(1));
            let reclaimed = store.reserve(mine + theirs, OwnerId::new(), LEASE).await.expect("reserve");
            let their_ids: HashSet<_> = their_tasks.iter().map(|task| task.id).collect();
            prop_assert_eq!(reclaimed.len(), theirs);
            prop_assert!(reclaimed.iter().all(|task| their_ids.contains(&task.id)));
            Ok(())
        })?;
    }

    /// Purging removes exactly the attempts older than the cutoff, spares
    /// reserved tasks, and is idempotent.
    #[test]
    fn purge_respects_cutoff_and_reservations(
        ages_secs in prop::collection::vec(0i64..1_000, 1..40),
        cutoff_age in 0i64..1_000,
        reserve_first in any::<bool>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let clock = TestClock::new();
            let store = MockTaskStore::new(Arc::new(clock.clone()));
            let now = clock.now_utc();
            let idle = seed(&store, &clock, &[3_600]).await.remove(0);
            let busy = seed(&store, &clock, &[0]).await.remove(0);
            if reserve_first {
                store.reserve(1, OwnerId::new(), LEASE).await.expect("reserve");
            }

            for (i, age) in ages_secs.iter().enumerate() {
                let task = if i % 2 == 0 { &idle } else { &busy };
                let response = DispatchResponse { status_code: 200, excerpt: String::new(), body_error: None };
                let mut attempt = build_attempt(task, now, Duration::ZERO, Ok(response));
                attempt.created_at = now - chrono::Duration::seconds(*age);
                store.insert_attempt(attempt).await;
            }

            let cutoff = now - chrono::Duration::seconds(cutoff_age);
            let purged = store.purge_attempts(cutoff).await.expect("purge");

            let expected = ages_secs
                .iter()
                .enumerate()
                .filter(|(i, age)| {
                    let spared = reserve_first && i % 2 == 1;
                    now - chrono::Duration::seconds(**age) < cutoff && !spared
                })
                .count();
            prop_assert_eq!(purged, expected as u64);

            for attempt in store.attempts().await {
                let spared = reserve_first && attempt.task_id == busy.id;
                prop_assert!(attempt.created_at >= cutoff || spared);
            }
            prop_assert_eq!(store.purge_attempts(cutoff).await.expect("purge"), 0);
            Ok(())
        })?;
    }
}
