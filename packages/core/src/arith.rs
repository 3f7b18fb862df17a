//! Pure balance arithmetic over the three buckets.
//!
//! Every function here is deterministic and free of I/O; where a notion of
//! "now" is needed it is passed in explicitly. None of the operations fail:
//! illegal inputs (negative deltas below zero, negative tranche amounts) are
//! clamped or dropped, never rejected.
//!
//! Debits charge buckets in a fixed priority order: trial first, then the
//! expiring tranches in ascending expiry order, then permanent. Trial credits
//! go first so earned permanent credits are preserved longest; expiring
//! credits go before permanent so tranches are not silently wasted.

use chrono::{DateTime, Utc};

use crate::credits::{ExpiringCredit, GrantMap, UserCredits};

/// Apply a grant to a balance.
///
/// `trial` and `permanent` deltas are signed and the result clamps at zero.
/// New tranches are merged into the existing list, keeping it sorted by
/// expiry; on equal expiries existing tranches stay ahead of new ones.
/// Tranches with a non-positive amount contribute nothing and are dropped.
pub fn grant(state: UserCredits, grant: &GrantMap) -> UserCredits {
    if grant.is_empty() {
        return state;
    }

    let mut next = state;

    if let Some(delta) = grant.trial {
        next.trial = (next.trial + delta).max(0);
    }
    if let Some(delta) = grant.permanent {
        next.permanent = (next.permanent + delta).max(0);
    }

    if !grant.expiring.is_empty() {
        let mut incoming: Vec<ExpiringCredit> = grant
            .expiring
            .iter()
            .filter(|t| t.amount > 0)
            .cloned()
            .collect();
        sort_expiring(&mut incoming);
        next.expiring = merge_expiring(next.expiring, incoming);
    }

    next
}

/// Charge `cost` milliseconds against a balance.
///
/// Returns `None` when `cost <= 0`; callers must treat that as "do not
/// write". Otherwise returns the new balance and the residual cost that
/// could not be covered (`0 <= remainder <= cost`). Drained tranches are
/// removed; tranches with a negative amount are dropped without being used.
pub fn deduct(state: UserCredits, cost: i64) -> Option<(UserCredits, i64)> {
    if cost <= 0 {
        return None;
    }

    let mut next = state;
    let mut due = cost;

    let from_trial = due.min(next.trial);
    next.trial -= from_trial;
    due -= from_trial;

    if due > 0 {
        let mut kept = Vec::with_capacity(next.expiring.len());
        for mut tranche in next.expiring {
            if tranche.amount < 0 {
                continue;
            }
            let take = due.min(tranche.amount);
            tranche.amount -= take;
            due -= take;
            if tranche.amount > 0 {
                kept.push(tranche);
            }
        }
        next.expiring = kept;
    }

    let from_permanent = due.min(next.permanent);
    next.permanent -= from_permanent;
    due -= from_permanent;

    Some((next, due))
}

/// Drop expired tranches from a balance.
///
/// With `sort` the expiring list is re-sorted first. Then the leading run of
/// tranches whose `expires_at <= now` is removed: a tranche expiring exactly
/// at `now` is expired, and survives only while strictly in the future.
pub fn expire(state: UserCredits, now: DateTime<Utc>, sort: bool) -> UserCredits {
    let mut next = state;
    if sort {
        sort_expiring(&mut next.expiring);
    }
    let keep_from = next
        .expiring
        .iter()
        .position(|t| !t.is_expired_at(now))
        .unwrap_or(next.expiring.len());
    if keep_from > 0 {
        next.expiring.drain(..keep_from);
    }
    next
}

/// Sort tranches ascending by expiry. Stable: equal expiries keep their
/// relative order.
pub fn sort_expiring(tranches: &mut [ExpiringCredit]) {
    tranches.sort_by_key(|t| t.expires_at);
}

/// Merge two expiry-sorted tranche lists into one sorted list.
///
/// Stable with `existing` taking precedence: on equal expiries, tranches
/// from `existing` come first.
pub fn merge_expiring(
    existing: Vec<ExpiringCredit>,
    incoming: Vec<ExpiringCredit>,
) -> Vec<ExpiringCredit> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut left = existing.into_iter().peekable();
    let mut right = incoming.into_iter().peekable();

    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => a.expires_at <= b.expires_at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_left {
            merged.extend(left.next());
        } else {
            merged.extend(right.next());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::credits::UserId;

    fn tranche(user_id: UserId, amount: i64, expires_at: DateTime<Utc>) -> ExpiringCredit {
        ExpiringCredit::new(user_id, amount, expires_at - Duration::days(1), expires_at)
    }

    #[test]
    fn priority_drain_crosses_buckets() {
        let user_id = UserId::new();
        let now = Utc::now();
        let state = UserCredits {
            user_id,
            trial: 500,
            permanent: 1000,
            expiring: vec![tranche(user_id, 300, now + Duration::minutes(10))],
        };

        let (next, remainder) = deduct(state, 900).unwrap();
        assert_eq!(next.trial, 0);
        assert!(next.expiring.is_empty());
        assert_eq!(next.permanent, 900);
        assert_eq!(remainder, 0);
    }

    #[test]
    fn deduct_zero_or_negative_is_a_no_op() {
        let state = UserCredits::zero(UserId::new());
        assert!(deduct(state.clone(), 0).is_none());
        assert!(deduct(state, -5).is_none());
    }

    #[test]
    fn deduct_reports_uncovered_remainder() {
        let user_id = UserId::new();
        let state = UserCredits {
            user_id,
            trial: 100,
            permanent: 50,
            expiring: Vec::new(),
        };
        let (next, remainder) = deduct(state, 400).unwrap();
        assert_eq!(next.total(), 0);
        assert_eq!(remainder, 250);
    }

    #[test]
    fn deduct_drops_negative_tranches_unused() {
        let user_id = UserId::new();
        let now = Utc::now();
        let mut bad = tranche(user_id, 100, now + Duration::hours(1));
        bad.amount = -100;
        let state = UserCredits {
            user_id,
            trial: 0,
            permanent: 200,
            expiring: vec![bad, tranche(user_id, 50, now + Duration::hours(2))],
        };
        let (next, remainder) = deduct(state, 60).unwrap();
        assert!(next.expiring.is_empty());
        assert_eq!(next.permanent, 190);
        assert_eq!(remainder, 0);
    }

    #[test]
    fn grant_keeps_expiring_sorted() {
        let user_id = UserId::new();
        let now = Utc::now();
        let day = |n: i64| now + Duration::days(n);

        let state = UserCredits::zero(user_id);
        let state = grant(
            state,
            &GrantMap::empty()
                .with_tranche(tranche(user_id, 1000, day(3)))
                .with_tranche(tranche(user_id, 1000, day(1))),
        );
        let state = grant(
            state,
            &GrantMap::empty().with_tranche(tranche(user_id, 1000, day(2))),
        );

        let expiries: Vec<_> = state.expiring.iter().map(|t| t.expires_at).collect();
        assert_eq!(expiries, vec![day(1), day(2), day(3)]);
    }

    #[test]
    fn grant_clamps_buckets_at_zero() {
        let user_id = UserId::new();
        let state = UserCredits {
            user_id,
            trial: 100,
            permanent: 50,
            expiring: Vec::new(),
        };
        let next = grant(
            state,
            &GrantMap::empty().with_trial(-500).with_permanent(-10),
        );
        assert_eq!(next.trial, 0);
        assert_eq!(next.permanent, 40);
    }

    #[test]
    fn empty_grant_returns_state_unchanged() {
        let user_id = UserId::new();
        let now = Utc::now();
        let state = UserCredits {
            user_id,
            trial: 7,
            permanent: 9,
            expiring: vec![tranche(user_id, 11, now + Duration::days(2))],
        };
        assert_eq!(grant(state.clone(), &GrantMap::empty()), state);
    }

    #[test]
    fn expire_drops_stale_tranches() {
        let user_id = UserId::new();
        let now = Utc::now();
        let state = UserCredits {
            user_id,
            trial: 0,
            permanent: 0,
            expiring: vec![
                tranche(user_id, 100, now - Duration::days(5)),
                tranche(user_id, 200, now + Duration::days(30)),
            ],
        };
        let next = expire(state, now, false);
        assert_eq!(next.expiring.len(), 1);
        assert_eq!(next.expiring[0].expires_at, now + Duration::days(30));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let user_id = UserId::new();
        let now = Utc::now();
        let state = UserCredits {
            user_id,
            trial: 0,
            permanent: 0,
            expiring: vec![tranche(user_id, 100, now)],
        };
        let next = expire(state, now, false);
        assert!(next.expiring.is_empty());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn arb_tranche(user_id: UserId) -> impl Strategy<Value = ExpiringCredit> {
            (1i64..=1_000_000, 0i64..=10_000_000).prop_map(move |(amount, offset_ms)| {
                let expires_at =
                    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap();
                tranche(user_id, amount, expires_at)
            })
        }

        fn arb_state() -> impl Strategy<Value = UserCredits> {
            let user_id = UserId::new();
            (
                0i64..=1_000_000,
                0i64..=1_000_000,
                prop::collection::vec(arb_tranche(user_id), 0..8),
            )
                .prop_map(move |(trial, permanent, mut expiring)| {
                    sort_expiring(&mut expiring);
                    UserCredits {
                        user_id,
                        trial,
                        permanent,
                        expiring,
                    }
                })
        }

        proptest! {
            #[test]
            fn non_negative_grants_are_monotone(
                state in arb_state(),
                trial in 0i64..=1_000_000,
                permanent in 0i64..=1_000_000,
            ) {
                let next = grant(
                    state.clone(),
                    &GrantMap::empty().with_trial(trial).with_permanent(permanent),
                );
                prop_assert!(next.trial >= state.trial);
                prop_assert!(next.permanent >= state.permanent);
            }

            #[test]
            fn signed_grants_clamp_at_zero(
                state in arb_state(),
                trial in -2_000_000i64..=2_000_000,
                permanent in -2_000_000i64..=2_000_000,
            ) {
                let next = grant(
                    state,
                    &GrantMap::empty().with_trial(trial).with_permanent(permanent),
                );
                prop_assert!(next.trial >= 0);
                prop_assert!(next.permanent >= 0);
            }

            #[test]
            fn deduct_conserves_credits(state in arb_state(), cost in 1i64..=5_000_000) {
                let before = state.total();
                let (next, remainder) = deduct(state, cost).unwrap();
                prop_assert!(remainder >= 0);
                prop_assert!(remainder <= cost);
                prop_assert_eq!(before, next.total() + (cost - remainder));
            }

            #[test]
            fn deduct_spares_permanent_while_trial_lasts(
                state in arb_state(),
                cost in 1i64..=5_000_000,
            ) {
                let (next, _) = deduct(state.clone(), cost).unwrap();
                if next.trial > 0 {
                    prop_assert_eq!(next.permanent, state.permanent);
                    prop_assert_eq!(
                        next.expiring.iter().map(|t| t.amount).sum::<i64>(),
                        state.expiring.iter().map(|t| t.amount).sum::<i64>()
                    );
                }
            }

            #[test]
            fn merge_is_a_sorted_permutation(a in arb_state(), b in arb_state()) {
                let merged = merge_expiring(a.expiring.clone(), b.expiring.clone());

                let mut concat = a.expiring.clone();
                concat.extend(b.expiring.clone());
                sort_expiring(&mut concat);

                prop_assert_eq!(
                    merged.iter().map(|t| t.expires_at).collect::<Vec<_>>(),
                    concat.iter().map(|t| t.expires_at).collect::<Vec<_>>()
                );
                prop_assert_eq!(
                    merged.iter().map(|t| t.amount).sum::<i64>(),
                    concat.iter().map(|t| t.amount).sum::<i64>()
                );
            }

            #[test]
            fn expire_is_idempotent(state in arb_state(), offset_ms in 0i64..=20_000_000) {
                let now =
                    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap();
                let once = expire(state, now, true);
                let twice = expire(once.clone(), now, false);
                prop_assert_eq!(once, twice);
            }
        }
    }
}
