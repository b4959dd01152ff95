//! Benchmark for status aggregation and LVMCluster validation
//!
//! Both run on every reconcile pass or admission request, so they must stay
//! cheap even on large clusters.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kube::core::ObjectMeta;
use lvms_operator::admission::validate_spec;
use lvms_operator::controlplane::status::aggregate;
use lvms_operator::crd::{
    DeviceClass, DeviceSelector, LVMCluster, LVMClusterSpec, LVMVolumeGroupNodeStatus,
    LVMVolumeGroupNodeStatusSpec, Storage, VGStatus, VGStatusType,
};

fn node_reports(nodes: usize, classes: usize) -> Vec<LVMVolumeGroupNodeStatus> {
    (0..nodes)
        .map(|n| {
            let node_status = (0..classes)
                .map(|c| VGStatus {
                    name: format!("vg{}", c),
                    status: if n % 97 == 0 {
                        VGStatusType::Progressing
                    } else {
                        VGStatusType::Ready
                    },
                    reason: String::new(),
                    devices: vec![format!("/dev/nvme{}n1", c)],
                    excluded: vec![],
                    device_discovery_policy: None,
                })
                .collect();
            LVMVolumeGroupNodeStatus::new(
                &format!("worker-{:04}", n),
                LVMVolumeGroupNodeStatusSpec { node_status },
            )
        })
        .collect()
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("status");

    for nodes in [10usize, 500] {
        let reports = node_reports(nodes, 4);
        group.throughput(Throughput::Elements(nodes as u64));
        group.bench_function(format!("aggregate_{}_nodes", nodes), |b| {
            b.iter(|| aggregate(black_box(&reports), nodes * 4));
        });
    }

    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let device_classes: Vec<DeviceClass> = (0..16)
        .map(|i| DeviceClass {
            name: format!("vg{}", i),
            device_selector: Some(DeviceSelector {
                paths: (0..8).map(|d| format!("/dev/disk/by-id/class{}-disk{}", i, d)).collect(),
                ..Default::default()
            }),
            default: i == 0,
            fstype: "xfs".to_string(),
            ..Default::default()
        })
        .collect();

    let cluster = LVMCluster {
        metadata: ObjectMeta {
            name: Some("bench".to_string()),
            namespace: Some("openshift-storage".to_string()),
            ..Default::default()
        },
        spec: LVMClusterSpec {
            tolerations: vec![],
            storage: Storage { device_classes },
        },
        status: None,
    };

    c.bench_function("validate_spec_16_classes", |b| {
        b.iter(|| validate_spec(black_box(&cluster)));
    });
}

criterion_group!(benches, bench_aggregate, bench_validate);
criterion_main!(benches);
