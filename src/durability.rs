//! The legacy observe-based durability poller (spec §4.F): waits for a mutation to be
//! replicated/persisted to a requested number of nodes when synchronous durability isn't in use.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::options::{DurabilityRequirement, PersistTo, ReplicateTo};
use crate::results::{DurabilityPollSchedule, MutationToken, ObserveSeqnoResult};
use crate::runtime;

/// One node's `OBSERVE_SEQNO` sample, tagged with whether it is the active node (counts toward
/// both persist and replicate thresholds) or a replica (counts toward replicate only until also
/// persisted).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ObserveSample {
    pub(crate) is_active: bool,
    pub(crate) result: ObserveSeqnoResult,
}

/// Runs one full poll-until-satisfied loop. `sample` is called once per node per round; it
/// performs the actual `OBSERVE_SEQNO` dispatch and is injected so this module stays a pure
/// state machine, testable without a live connection.
pub(crate) async fn poll_until_satisfied<F, Fut>(
    token: &MutationToken,
    durability: &DurabilityRequirement,
    deadline: Instant,
    schedule: DurabilityPollSchedule,
    mut sample: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<ObserveSample>>>,
{
    let mut delay = schedule.initial_delay;
    loop {
        let samples = sample().await?;
        match evaluate(&samples, token, durability) {
            Evaluation::Satisfied => return Ok(()),
            Evaluation::Ambiguous => return Err(Error::new(crate::error::ErrorKind::DurabilityAmbiguous)),
            Evaluation::NotYet => {}
        }

        if Instant::now() + delay > deadline {
            return Err(Error::ambiguous_timeout());
        }
        runtime::sleep(delay).await;
        delay = delay.saturating_mul(2).min(schedule.max_delay);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Evaluation {
    Satisfied,
    /// A sampled node's `vbucket_uuid` no longer matches the mutation token: a failover
    /// occurred mid-poll and this poll's outcome can never be confirmed.
    Ambiguous,
    NotYet,
}

fn evaluate(samples: &[ObserveSample], token: &MutationToken, durability: &DurabilityRequirement) -> Evaluation {
    let mut persisted = 0u8;
    let mut replicated = 0u8;

    for sample in samples {
        if sample.result.vbucket_uuid != token.partition_uuid {
            return Evaluation::Ambiguous;
        }
        // persist_to counts nodes (active or replica) that have the mutation on disk;
        // replicate_to counts only replicas that have it in memory, per Couchbase semantics
        // the active node doesn't count as one of its own replicas.
        if !sample.is_active && sample.result.current_seqno >= token.sequence_number {
            replicated += 1;
        }
        if sample.result.last_persisted_seqno >= token.sequence_number {
            persisted += 1;
        }
    }

    let persist_satisfied = match durability.persist_to {
        PersistTo::None => true,
        PersistTo::N(n) => persisted >= n,
    };
    let replicate_satisfied = match durability.replicate_to {
        ReplicateTo::None => true,
        ReplicateTo::N(n) => replicated >= n,
    };

    if persist_satisfied && replicate_satisfied {
        Evaluation::Satisfied
    } else {
        Evaluation::NotYet
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> MutationToken {
        MutationToken {
            bucket_name: "travel".into(),
            partition_id: 1,
            partition_uuid: 42,
            sequence_number: 100,
        }
    }

    fn sample(uuid: u64, persisted: u64, current: u64, is_active: bool) -> ObserveSample {
        ObserveSample {
            is_active,
            result: ObserveSeqnoResult {
                vbucket_uuid: uuid,
                last_persisted_seqno: persisted,
                current_seqno: current,
            },
        }
    }

    #[test]
    fn satisfied_once_persist_and_replicate_thresholds_are_met() {
        let durability = DurabilityRequirement {
            persist_to: PersistTo::N(1),
            replicate_to: ReplicateTo::N(1),
            ..DurabilityRequirement::none()
        };
        let samples = vec![sample(42, 100, 100, true), sample(42, 0, 100, false)];
        assert_eq!(evaluate(&samples, &token(), &durability), Evaluation::Satisfied);
    }

    #[test]
    fn not_yet_when_persist_threshold_unmet() {
        let durability = DurabilityRequirement {
            persist_to: PersistTo::N(2),
            ..DurabilityRequirement::none()
        };
        let samples = vec![sample(42, 100, 100, true), sample(42, 0, 100, false)];
        assert_eq!(evaluate(&samples, &token(), &durability), Evaluation::NotYet);
    }

    #[test]
    fn ambiguous_when_vbucket_uuid_has_changed() {
        let durability = DurabilityRequirement {
            persist_to: PersistTo::N(1),
            ..DurabilityRequirement::none()
        };
        let samples = vec![sample(99, 100, 100, true)];
        assert_eq!(evaluate(&samples, &token(), &durability), Evaluation::Ambiguous);
    }

    #[tokio::test]
    async fn poll_until_satisfied_returns_ok_on_first_satisfied_round() {
        let durability = DurabilityRequirement {
            persist_to: PersistTo::N(1),
            ..DurabilityRequirement::none()
        };
        let result = poll_until_satisfied(&token(), &durability, Instant::now() + Duration::from_secs(1), DurabilityPollSchedule::default(), || async {
            Ok(vec![sample(42, 100, 100, true)])
        })
        .await;
        assert!(result.is_ok());
    }
}
