use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::collections::BTreeSet;

use apm_orchestrator::{
    AgentRegistry, InitialContext, Orchestrator, OrchestratorConfig, ProcessTemplate, StepSpec,
    action_fn,
};

/// Registry where only the last agent can serve `"rare"`.
fn registry_with(agents: usize) -> AgentRegistry {
    let registry = AgentRegistry::new();
    for i in 0..agents {
        let mut caps = vec!["pick".to_string(), "pack".to_string()];
        if i + 1 == agents {
            caps.push("rare".to_string());
        }
        registry.register_agent(format!("agent-{i}"), caps);
    }
    registry
}

fn bench_agent_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("agent_matching");
    let required: BTreeSet<String> = ["pack", "rare"].iter().map(|s| s.to_string()).collect();

    for agents in [10usize, 100, 1_000] {
        let registry = registry_with(agents);
        group.throughput(Throughput::Elements(agents as u64));

        group.bench_with_input(BenchmarkId::new("find_worst_case", agents), &agents, |b, _| {
            b.iter(|| black_box(registry.find_available_agent(black_box(&required))))
        });

        group.bench_with_input(BenchmarkId::new("acquire_release", agents), &agents, |b, _| {
            b.iter(|| {
                let lease = registry.try_acquire(&required, &"s1".into());
                black_box(lease)
            })
        });
    }

    group.finish();
}

fn bench_process_execution(c: &mut Criterion) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build tokio runtime: {e}"),
    };
    let mut group = c.benchmark_group("process_execution");

    for steps in [1usize, 10, 50] {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        orch.register_agent("A1", ["work"]);

        let mut template = ProcessTemplate::new("T1", "");
        for i in 0..steps {
            template.add_step(StepSpec::new(format!("s{i}")).requires("work").with_action(
                action_fn(|ctx, _| {
                    ctx.set_variable("touched", true);
                    Ok(())
                }),
            ));
        }
        orch.register_template(template).unwrap();

        let mut next = 0u64;
        group.throughput(Throughput::Elements(steps as u64));
        group.bench_with_input(BenchmarkId::new("execute", steps), &steps, |b, _| {
            b.iter(|| {
                next += 1;
                let id = format!("P{next}");
                orch.create_process("T1", id.as_str(), InitialContext::for_template("T1"))
                    .unwrap();
                black_box(runtime.block_on(orch.execute_process(&id)).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_agent_matching, bench_process_execution);
criterion_main!(benches);
