//! Properties of the control plane that hold without any backing service:
//! deterministic table naming, target-file validation, statistics merge
//! laws and state-machine monotonicity.

use std::collections::BTreeMap;

use iris::registry::{forge_table_name, merge_round_statistics, parse_table_name};
use iris::targets::{validate_probes_file, validate_target_file, TargetFileKind};
use iris::types::{
    AgentId, MeasurementAgentState, MeasurementId, ProbingStatistics, RoundComplete,
    RoundOutcome, RoundTask, Tool, ToolParameters,
};
use uuid::Uuid;

#[test]
fn table_name_round_trips_for_any_uuid_pair() {
    for _ in 0..100 {
        let m = MeasurementId(Uuid::new_v4());
        let a = AgentId(Uuid::new_v4());
        let name = forge_table_name(m, a);
        assert!(name.starts_with("results__"));
        assert_eq!(parse_table_name(&name).unwrap(), (m, a));
    }
}

#[test]
fn table_name_matches_the_documented_vector() {
    let m = MeasurementId("1b830be7-2b42-401b-bbe6-6b1baf02c9be".parse().unwrap());
    let a = AgentId("b17fe299-17bf-4dbe-9ae3-f600b540ec1f".parse().unwrap());
    assert_eq!(
        forge_table_name(m, a),
        "results__1b830be7_2b42_401b_bbe6_6b1baf02c9be__b17fe299_17bf_4dbe_9ae3_f600b540ec1f"
    );
}

fn stats(probes_sent: u64) -> ProbingStatistics {
    ProbingStatistics {
        probes_sent,
        ..ProbingStatistics::default()
    }
}

#[test]
fn statistics_merge_commutes_across_distinct_rounds() {
    let one_then_two = merge_round_statistics(
        merge_round_statistics(BTreeMap::new(), 1, &stats(10))
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap(), v))
            .collect(),
        2,
        &stats(20),
    );
    let two_then_one = merge_round_statistics(
        merge_round_statistics(BTreeMap::new(), 2, &stats(20))
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap(), v))
            .collect(),
        1,
        &stats(10),
    );
    assert_eq!(one_then_two, two_then_one);
    assert_eq!(one_then_two.len(), 2);
}

#[test]
fn statistics_merge_is_last_write_wins_per_round() {
    let first = merge_round_statistics(BTreeMap::new(), 1, &stats(10));
    let second = merge_round_statistics(
        first
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap(), v))
            .collect(),
        1,
        &stats(99),
    );
    assert_eq!(second.len(), 1);
    assert_eq!(second["1"].probes_sent, 99);
}

#[test]
fn statistics_round_keys_are_strings_in_the_blob() {
    let merged = merge_round_statistics(BTreeMap::new(), 7, &stats(1));
    let blob = serde_json::to_string(&merged).unwrap();
    assert!(blob.contains("\"7\""));
}

#[test]
fn target_file_acceptance_vectors() {
    let body = "1.1.1.0/24,icmp,2,32\n2.2.2.0/24,udp,5,20";
    assert!(validate_target_file(body, TargetFileKind::TargetsList).is_ok());
    assert!(validate_target_file(&format!("{body}\n"), TargetFileKind::TargetsList).is_ok());
    assert!(validate_target_file(body, TargetFileKind::PrefixesList).is_ok());

    assert!(validate_target_file("", TargetFileKind::TargetsList).is_err());
    assert!(validate_target_file(&format!("{body}\n\n"), TargetFileKind::TargetsList).is_err());
    assert!(validate_target_file("test,icmp,2,32", TargetFileKind::TargetsList).is_err());
    assert!(validate_target_file("1.1.1.0/24,icmt,2,32", TargetFileKind::TargetsList).is_err());
    assert!(validate_target_file("1.1.1.0/24,icmp,0,32", TargetFileKind::TargetsList).is_err());
    assert!(validate_target_file("1.1.1.0/24,icmp,33,32", TargetFileKind::TargetsList).is_err());
}

#[test]
fn probes_file_acceptance_vectors() {
    assert!(validate_probes_file("8.8.8.8,24000,33434,32,icmp").is_ok());
    assert!(validate_probes_file("8.8.453.8,24000,33434,32,icmp").is_err());
    assert!(validate_probes_file("8.8.8.8,24000,0,32,icmp").is_err());
    assert!(validate_probes_file("8.8.8.8,24000,33434,32,icmt").is_err());
}

#[test]
fn first_terminal_state_wins() {
    use MeasurementAgentState::*;
    // After Finished, a cancel stamp must not apply, and vice versa.
    assert!(!Finished.can_transition(Canceled));
    assert!(!Canceled.can_transition(Finished));
    assert!(!AgentFailure.can_transition(Finished));
    // The only way into a terminal state is from a live one.
    assert!(Ongoing.can_transition(Finished));
    assert!(Created.can_transition(Ongoing));
}

#[test]
fn round_messages_survive_the_bus_encoding() {
    let task = RoundTask {
        measurement_uuid: MeasurementId(Uuid::new_v4()),
        agent_uuid: AgentId(Uuid::new_v4()),
        round: 2,
        tool: Tool::DiamondMiner,
        probing_rate: Some(1000),
        tool_parameters: ToolParameters::default(),
        target_file_key: None,
        probes_file_key: Some("m/a_next_round_2.csv.zst".to_string()),
        username: "admin".to_string(),
    };
    let decoded: RoundTask =
        serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
    assert_eq!(decoded, task);

    let complete = RoundComplete {
        measurement_uuid: task.measurement_uuid,
        agent_uuid: task.agent_uuid,
        round: 2,
        outcome: RoundOutcome::Completed {
            result_key: "m/a_results_2.csv".to_string(),
        },
    };
    let decoded: RoundComplete =
        serde_json::from_str(&serde_json::to_string(&complete).unwrap()).unwrap();
    assert_eq!(decoded, complete);
}
