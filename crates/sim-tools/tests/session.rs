//! End-to-end sessions driven through the engine

use sim_core::fixtures::demo_cluster;
use sim_core::{ClusterConfig, JobState, Severity};
use sim_shell::{parse, FuzzyMatcher};
use sim_state::{parse_faults, FaultInjectionConfig, FaultKind, SnapshotManager, JOB_START_DELAY_MS};
use sim_tools::Engine;

fn engine(nodes: u32, gpus_per_node: u32) -> Engine {
    let state = demo_cluster(&ClusterConfig {
        nodes,
        gpus_per_node,
        ..ClusterConfig::default()
    });
    Engine::new(state, SnapshotManager::new(10), FuzzyMatcher::default()).with_color(false)
}

fn xid79(node: &str, gpu: u32) -> FaultInjectionConfig {
    FaultInjectionConfig::new(node, Some(gpu), FaultKind::XidError { xid: 79 })
        .with_severity(Severity::Critical)
}

#[test]
fn fallen_gpu_drill() {
    let mut engine = engine(1, 1);
    let uuid = engine.state().nodes[0].gpus[0].uuid.clone();

    let healthy = engine.execute("nvidia-smi -r -i 0");
    assert_eq!(healthy.exit_code, 0);

    let faults = parse_faults(
        r#"{ "nodeId": "dgx-00", "gpuId": 0, "type": "xid-error",
             "severity": "critical", "parameters": { "xid": 79 } }"#,
    )
    .unwrap();
    assert_eq!(engine.apply_faults(&faults), 1);

    let listing = engine.execute("nvidia-smi");
    assert_eq!(listing.exit_code, 0);
    assert!(listing.output.contains("WARNING"));
    assert!(listing.output.contains("XID 79"));
    assert!(!listing.output.contains(&uuid));

    let reset = engine.execute("nvidia-smi -r -i 0");
    assert_eq!(reset.exit_code, 0);
    assert!(reset.output.contains("Unable to reset"));
    assert!(reset.output.contains("fallen off the bus"));

    let diag = engine.execute("dcgmi diag -r 1 -i 0");
    assert_eq!(diag.exit_code, 1);
    assert!(diag.output.contains("inaccessible"));

    let kernel = engine.execute("dmesg | grep -i xid");
    assert!(kernel.output.contains("79"));
}

#[test]
fn snapshots_are_isolated_from_live_state() {
    let mut engine = engine(2, 4);
    let id = engine.create_snapshot("clean", Some("before the drill"));
    let saved = engine
        .snapshots()
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.cluster_state_copy.clone())
        .unwrap();

    engine.apply_faults(&[xid79("dgx-01", 3)]);
    let kept = engine.snapshots().iter().find(|s| s.id == id).unwrap();
    assert_eq!(kept.cluster_state_copy, saved);
    assert_ne!(engine.state(), &saved);

    assert!(engine.restore_snapshot(&id));
    assert_eq!(engine.state(), &saved);
    assert!(!engine.restore_snapshot("no-such-snapshot"));
}

#[test]
fn clearing_faults_twice_changes_nothing() {
    let mut engine = engine(2, 4);
    engine.apply_faults(&[
        xid79("dgx-00", 1),
        FaultInjectionConfig::new("dgx-01", Some(0), FaultKind::Thermal { temperature: 95 }),
    ]);
    engine.clear_faults();
    let once = engine.state().clone();
    engine.clear_faults();
    assert_eq!(engine.state(), &once);
    assert!(engine.state().nodes.iter().all(|n| n.gpus.iter().all(|g| !g.is_fallen_off_bus())));
}

#[test]
fn drained_node_reason_is_visible() {
    let mut engine = engine(2, 8);
    let drain = engine.execute("scontrol update nodename=dgx-01 state=drain reason=\"GPU check\"");
    assert_eq!(drain.exit_code, 0, "{}", drain.output);

    let reasons = engine.execute("sinfo -R");
    assert!(reasons.output.contains("GPU check"));
    assert!(reasons.output.contains("dgx-01"));

    let node = engine.execute("scontrol show node dgx-01");
    assert!(node.output.contains("Reason=GPU check"));
}

#[test]
fn running_job_drives_gpu_utilization() {
    let mut engine = engine(1, 8);
    let submitted = engine.execute("sbatch --gres=gpu:2 -t 30 --wrap=\"python train.py\"");
    assert_eq!(submitted.exit_code, 0, "{}", submitted.output);

    engine.tick(JOB_START_DELAY_MS);
    let util = engine.execute("nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits");
    assert_eq!(util.output.lines().filter(|l| l.trim() == "97").count(), 2);
    assert!(engine.execute("squeue").output.contains("  R "));
}

#[test]
fn restored_snapshot_keeps_the_job_queue_moving() {
    let mut engine = engine(1, 8);
    assert!(engine.execute("sbatch --gres=gpu:2 -t 1 --wrap=\"python train.py\"").is_success());
    let id = engine.create_snapshot("queued", None);

    engine.tick(5_000);
    assert_eq!(engine.state().jobs[0].state, JobState::Running);
    assert!(engine.restore_snapshot(&id));
    assert_eq!(engine.state().jobs[0].state, JobState::Pending);

    engine.tick(JOB_START_DELAY_MS);
    assert_eq!(engine.state().jobs[0].state, JobState::Running);
    assert!(engine.execute("squeue").output.contains("  R "));

    engine.tick(60_000);
    assert_eq!(engine.state().jobs[0].state, JobState::Completed);
    let util = engine.execute("nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits");
    assert!(util.output.lines().all(|l| l.trim() == "0"));
}

#[test]
fn clearing_faults_leaves_running_jobs_alone() {
    let mut engine = engine(2, 4);
    assert!(engine.execute("sbatch --gres=gpu:4 -w dgx-00 --wrap=\"python train.py\"").is_success());
    engine.tick(JOB_START_DELAY_MS);
    engine.apply_faults(&[FaultInjectionConfig::new(
        "dgx-00",
        Some(1),
        FaultKind::Thermal { temperature: 94 },
    )]);

    engine.clear_faults();
    assert!(engine.execute("squeue").output.contains("  R "));
    let util = engine.execute("nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits");
    assert_eq!(util.output.lines().filter(|l| l.trim() == "97").count(), 4);
    assert!(engine.execute("sinfo -N").output.contains("alloc"));
}

#[test]
fn clearing_faults_powers_nodes_back_into_service() {
    let mut engine = engine(1, 2);
    assert!(engine.execute("ipmitool chassis power off").is_success());
    assert!(engine.execute("sinfo -R").output.contains("Node powered off"));

    engine.clear_faults();
    assert!(engine
        .execute("ipmitool chassis power status")
        .output
        .contains("Chassis Power is on"));
    let sinfo = engine.execute("sinfo -N");
    assert!(sinfo.output.contains("idle"), "{}", sinfo.output);
    assert!(!engine.execute("sinfo -R").output.contains("Node powered off"));
}

#[test]
fn pipes_count_duplicate_lines() {
    let mut engine = engine(1, 4);
    let result = engine.execute("nvidia-smi --query-gpu=name --format=csv,noheader | sort | uniq -c");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output.lines().count(), 1);
    assert!(result.output.trim_start().starts_with('4'));
}

#[test]
fn raw_args_are_the_split_tail() {
    let line = "nvidia-smi   -q -d  MEMORY -i 0";
    let parsed = parse(line);
    let expected: Vec<String> = line.split_whitespace().skip(1).map(String::from).collect();
    assert_eq!(parsed.raw_args, expected);
}

#[test]
fn unknown_commands_and_hosts_get_suggestions() {
    let mut engine = engine(3, 2);
    let typo = engine.execute("ibsat");
    assert_eq!(typo.exit_code, 1);
    assert!(typo.output.contains("ibsat: command not found"));
    assert!(typo.output.contains("ibstat"));

    let host = engine.execute("ssh dgx-2");
    assert_eq!(host.exit_code, 1);
    assert!(host.output.contains("Could not resolve hostname dgx-2"));
    assert!(host.output.contains("dgx-02"));

    assert!(engine.execute("ssh dgx-02").is_success());
    assert_eq!(engine.prompt(), "root@dgx-02:~# ");
}
