//! Cross-replica syscall comparison.

use crate::summary::{DivergenceGroup, DivergenceReport, ReplicaId};
use indexmap::IndexMap;
use vatworks_core::DeliveryNum;
use vatworks_transcript::{PositionDump, SyscallStatus};

type GroupKey = (Option<SyscallStatus>, Option<String>, Option<String>);

fn group_key(dump: Option<&PositionDump>) -> GroupKey {
    let Some(dump) = dump else {
        return (None, None, None);
    };
    let syscall = dump.actual.clone().or_else(|| dump.expected.clone());
    // Responses only mean something when the replica was answered from the recording
    let response = match dump.status {
        SyscallStatus::Ok | SyscallStatus::Simulated | SyscallStatus::Tolerated => {
            dump.response.clone()
        }
        _ => None,
    };
    (Some(dump.status), syscall, response)
}

/// Compare the dumps of every replica for one delivery
///
/// Returns the first syscall position at which the replicas did not all
/// behave the same way. Later positions are not compared: after a replica
/// goes wrong its answers come from the sticky error and its position indices
/// may be shifted, so every later position would differ too. Fewer than two
/// replicas never diverge.
#[must_use]
pub fn detect_divergence(
    delivery_num: DeliveryNum,
    dumps: &[(ReplicaId, &[PositionDump])],
) -> Option<DivergenceReport> {
    if dumps.len() < 2 {
        return None;
    }
    let positions = dumps.iter().map(|(_, dump)| dump.len()).max().unwrap_or(0);

    (0..positions).find_map(|position| {
        let mut groups: IndexMap<GroupKey, Vec<ReplicaId>> = IndexMap::new();
        for (replica, dump) in dumps {
            let entry = dump.iter().find(|d| d.position == position);
            groups.entry(group_key(entry)).or_default().push(*replica);
        }
        (groups.len() > 1).then(|| DivergenceReport {
            delivery_num,
            position,
            groups: groups
                .into_iter()
                .map(|((kind, syscall, response), replicas)| DivergenceGroup {
                    kind,
                    syscall,
                    response,
                    replicas,
                })
                .collect(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(position: usize, syscall: &str, response: &str) -> PositionDump {
        PositionDump {
            position,
            status: SyscallStatus::Ok,
            expected: Some(syscall.to_string()),
            actual: Some(syscall.to_string()),
            response: Some(response.to_string()),
        }
    }

    #[test]
    fn test_agreeing_replicas() {
        let a = vec![ok(0, "get a", "1"), ok(1, "set a", "null")];
        let b = a.clone();
        assert!(detect_divergence(3, &[(ReplicaId(0), &a), (ReplicaId(1), &b)]).is_none());
    }

    #[test]
    fn test_single_replica_never_diverges() {
        let a = vec![ok(0, "get a", "1")];
        assert!(detect_divergence(3, &[(ReplicaId(0), &a)]).is_none());
    }

    #[test]
    fn test_divergence_at_last_syscall() {
        let a = vec![ok(0, "get a", "1"), ok(1, "set a", "null")];
        let b = vec![
            ok(0, "get a", "1"),
            PositionDump {
                position: 1,
                status: SyscallStatus::Wrong,
                expected: Some("set a".to_string()),
                actual: Some("set b".to_string()),
                response: Some("error".to_string()),
            },
        ];
        let c = a.clone();
        let report = detect_divergence(
            9,
            &[(ReplicaId(0), &a), (ReplicaId(1), &b), (ReplicaId(2), &c)],
        )
        .unwrap();
        assert_eq!(report.delivery_num, 9);
        assert_eq!(report.position, 1);
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].replicas, vec![ReplicaId(0), ReplicaId(2)]);
        assert_eq!(report.groups[1].replicas, vec![ReplicaId(1)]);
        assert_eq!(report.groups[1].syscall.as_deref(), Some("set b"));
        assert_eq!(report.groups[1].response, None);
    }

    #[test]
    fn test_missing_position_is_its_own_group() {
        let a = vec![ok(0, "get a", "1"), ok(1, "set a", "null")];
        let b = vec![ok(0, "get a", "1")];
        let report = detect_divergence(1, &[(ReplicaId(0), &a), (ReplicaId(1), &b)]).unwrap();
        assert_eq!(report.position, 1);
        assert_eq!(report.groups[1].kind, None);
    }

    #[test]
    fn test_same_syscall_different_response() {
        let a = vec![ok(0, "get a", "1")];
        let b = vec![ok(0, "get a", "2")];
        let report = detect_divergence(1, &[(ReplicaId(0), &a), (ReplicaId(1), &b)]).unwrap();
        assert_eq!(report.position, 0);
    }

    #[test]
    fn test_wrong_syscall_reported_once() {
        let recorded = ["get a", "get b", "get c", "get d"];
        let good: Vec<PositionDump> = recorded
            .iter()
            .enumerate()
            .map(|(i, syscall)| ok(i, syscall, "1"))
            .collect();
        // Later syscalls still match the recording but get the sticky error
        let mut bad = vec![PositionDump {
            position: 0,
            status: SyscallStatus::Wrong,
            expected: Some("get a".to_string()),
            actual: Some("get X".to_string()),
            response: Some("error".to_string()),
        }];
        bad.extend(
            recorded
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, syscall)| ok(i, syscall, "error")),
        );
        let other = good.clone();

        let report = detect_divergence(
            4,
            &[(ReplicaId(0), &good), (ReplicaId(1), &bad), (ReplicaId(2), &other)],
        )
        .unwrap();
        assert_eq!(report.position, 0);
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].replicas, vec![ReplicaId(0), ReplicaId(2)]);
        assert_eq!(report.groups[1].replicas, vec![ReplicaId(1)]);
    }

    #[test]
    fn test_shifted_positions_reported_once() {
        let a = vec![ok(0, "get a", "1"), ok(1, "get b", "2"), ok(2, "get c", "3")];
        let b = vec![
            PositionDump {
                position: 0,
                status: SyscallStatus::Simulated,
                expected: None,
                actual: Some("get vc.1.|label".to_string()),
                response: Some("\"x\"".to_string()),
            },
            ok(1, "get a", "1"),
            ok(2, "get b", "2"),
            ok(3, "get c", "3"),
        ];
        let report = detect_divergence(2, &[(ReplicaId(0), &a), (ReplicaId(1), &b)]).unwrap();
        assert_eq!(report.position, 0);
    }
}
