//! Probe generation and result ingestion seen through the public API.

use iris::probes::{FlowMapper, GenerationParams, ProbeGenerator, ProbeSpec};
use iris::targets::{validate_target_file, TargetFileKind};
use iris::types::{FlowMapperConfig, Protocol};
use iris::worker::results::parse_result_file;

#[test]
fn a_prefix_list_expands_into_the_requested_flow_fan_out() {
    let rows = validate_target_file("10.0.0.0/23,udp,2,3", TargetFileKind::PrefixesList).unwrap();
    let generator = ProbeGenerator::new(
        rows,
        GenerationParams {
            prefix_len_v4: 24,
            prefix_len_v6: 64,
            min_flow: 0,
            max_flow: 6,
            destination_port: 33434,
            source_port_base: 24000,
            mapper: Some(FlowMapperConfig::Sequential),
        },
    );
    let probes: Vec<ProbeSpec> = generator.collect();
    // 2 subnets x 2 ttls x 7 flows.
    assert_eq!(probes.len(), 28);
    assert!(probes.iter().all(|p| p.destination_port == 33434));
    assert!(probes.iter().all(|p| p.protocol == Protocol::Udp));
    assert!(probes.iter().all(|p| (2..=3).contains(&p.ttl)));
}

#[test]
fn generated_probes_are_valid_probe_rows() {
    let rows = validate_target_file("8.8.8.8,icmp,4,6", TargetFileKind::TargetsList).unwrap();
    let generator = ProbeGenerator::new(
        rows,
        GenerationParams {
            prefix_len_v4: 32,
            prefix_len_v6: 128,
            min_flow: 0,
            max_flow: 0,
            destination_port: 33434,
            source_port_base: 24000,
            mapper: None,
        },
    );
    let body = generator
        .map(|p| p.to_csv())
        .collect::<Vec<_>>()
        .join("\n");
    let parsed = iris::targets::validate_probes_file(&body).unwrap();
    assert_eq!(parsed.len(), 3);
    assert!(parsed.iter().all(|p| p.destination.to_string() == "8.8.8.8"));
}

#[test]
fn mappers_are_deterministic_across_instances() {
    for config in [
        FlowMapperConfig::Sequential,
        FlowMapperConfig::ReverseByte,
        FlowMapperConfig::Random { seed: 7 },
    ] {
        let a = FlowMapper::new(config, 8);
        let b = FlowMapper::new(config, 8);
        for flow in 0..300 {
            assert_eq!(a.map(flow), b.map(flow));
        }
    }
}

#[test]
fn a_result_file_with_statistics_ingests_cleanly() {
    let content = "\
1.2.3.4,10.20.30.0,10.20.30.40,8.8.8.8,udp,17000,33434,5,5,11,0,32.4,56,46,1,1
1.2.3.4,10.20.30.0,10.20.30.41,9.9.9.9,udp,17001,33434,6,6,11,0,30.1,55,46,1,1
# probes_sent=2 replies_received=2
# duration_ms=40 peak_memory_bytes=4096
";
    let (rows, stats) = parse_result_file(content, "a_results_1.csv").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(stats.probes_sent, 2);
    assert_eq!(stats.replies_received, 2);
    assert_eq!(stats.duration_ms, 40);
    assert!(!stats.empty_results);
}
