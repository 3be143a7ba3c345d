// Network filter benchmarks
//
// - Port list canonicalisation (sort, merge overlapping and adjacent ranges)
// - Filter assembly from hostnames, CIDRs and ports (no DNS lookups)
// - tc batch rendering for many interfaces and include entries
//
// Usage:
//   cargo bench --bench network_filter

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use host_fault_agent::exec::RecordingRunner;
use host_fault_agent::network::tc::{render_egress, AttackQdisc};
use host_fault_agent::network::{build_filter, AgentPorts, Cidr, FilterRequest, PortSet};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn port_specs(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let from = (i * 37 % 60_000) as u16 + 1;
            if i % 3 == 0 {
                from.to_string()
            } else {
                format!("{}-{}", from, from + (i % 50) as u16)
            }
        })
        .collect()
}

fn cidrs(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("10.{}.{}.0/24", (i / 256) % 256, i % 256))
        .collect()
}

fn bench_port_canonicalisation(c: &mut Criterion) {
    let mut group = c.benchmark_group("port_set_parse");
    for count in [10, 100, 1000] {
        let specs = port_specs(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &specs, |b, specs| {
            b.iter(|| PortSet::parse(black_box(specs)).unwrap())
        });
    }
    group.finish();
}

fn bench_build_filter(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let runner = RecordingRunner::new();
    let mut group = c.benchmark_group("build_filter");
    for count in [10, 100, 500] {
        let request = FilterRequest {
            cidrs: cidrs(count),
            ports: port_specs(count / 10 + 1),
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(count), &request, |b, request| {
            b.iter(|| {
                rt.block_on(build_filter(&runner, black_box(request), AgentPorts::default()))
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_render_egress(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let runner = RecordingRunner::new();
    let qdisc = AttackQdisc::Netem("delay 500ms 150ms".to_string());
    let mut group = c.benchmark_group("render_egress");
    for count in [10, 100, 500] {
        let request = FilterRequest {
            cidrs: cidrs(count),
            ports: vec!["80".to_string(), "443".to_string(), "8000-8999".to_string()],
            ..Default::default()
        };
        let filter = rt
            .block_on(build_filter(&runner, &request, AgentPorts::default()))
            .unwrap();
        let interfaces = vec!["eth0".to_string(), "eth1".to_string()];
        group.bench_with_input(BenchmarkId::from_parameter(count), &filter, |b, filter| {
            b.iter(|| render_egress(black_box(&interfaces), black_box(filter), &qdisc))
        });
    }
    group.finish();
}

fn bench_cidr_parse(c: &mut Criterion) {
    let nets = cidrs(256);
    c.bench_function("cidr_parse_256", |b| {
        b.iter(|| {
            nets.iter()
                .map(|n| n.parse::<Cidr>().unwrap())
                .collect::<Vec<_>>()
        })
    });
}

criterion_group!(
    benches,
    bench_port_canonicalisation,
    bench_build_filter,
    bench_render_egress,
    bench_cidr_parse
);
criterion_main!(benches);
