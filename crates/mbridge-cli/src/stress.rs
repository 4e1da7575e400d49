use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use mbridge_attach::DetachPolicy;
use mbridge_host::{Bridge, BridgeConfig};
use mbridge_operator::managed::{associative_provider, define_contract_classes, AssociativeReply};
use mbridge_operator::{AdapterConfig, MergeOperator, ProviderRetention};
use mbridge_runtime::SimRuntime;
use serde::Serialize;
use tracing::info;

const PROVIDER: &str = "mbridge/cli/KeyedAppend";

/// One stress run.
#[derive(Clone, Copy, Debug)]
pub struct StressPlan {
    pub threads: usize,
    pub calls: usize,
    pub policy: DetachPolicy,
    pub zero_copy: bool,
    pub retention: ProviderRetention,
}

#[derive(Clone, Debug, Serialize)]
pub struct ThreadStats {
    pub thread: usize,
    pub attaches: u64,
    pub detaches_before_exit: u64,
    pub mismatches: usize,
    pub failures: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StressReport {
    pub operator: String,
    pub threads: usize,
    pub calls_per_thread: usize,
    pub policy: String,
    pub retention: String,
    pub elapsed_ms: f64,
    pub calls_per_sec: f64,
    pub per_thread: Vec<ThreadStats>,
    pub live_local_refs: usize,
    pub total_attaches: u64,
    pub total_detaches: u64,
}

impl StressReport {
    pub fn mismatches(&self) -> usize {
        self.per_thread.iter().map(|t| t.mismatches).sum()
    }

    pub fn failures(&self) -> usize {
        self.per_thread.iter().map(|t| t.failures).sum()
    }
}

/// Each call's result is the key followed by the incoming value, so every
/// thread can check it saw exactly its own arguments.
fn expected(key: &[u8], value: &[u8]) -> Vec<u8> {
    [key, value].concat()
}

pub fn run(plan: StressPlan) -> anyhow::Result<StressReport> {
    let rt = Arc::new(SimRuntime::new());
    let config = BridgeConfig {
        detach_policy: plan.policy,
        provider_retention: plan.retention,
        ..BridgeConfig::default()
    };
    define_contract_classes(&rt, &config.class_names)?;
    rt.define_class(associative_provider(
        &config.class_names,
        PROVIDER,
        plan.zero_copy,
        |key, _, value| Ok(AssociativeReply::Value(expected(key, value))),
    ))?;

    let bridge = Bridge::new(rt.clone(), config)?;
    bridge.load().context("loading bridge")?;

    let adapter_config = if plan.zero_copy {
        AdapterConfig::zero_copy()
    } else {
        AdapterConfig::associative()
    };
    let handle = bridge.adapters().create_native(&adapter_config);
    {
        let guard = bridge.attach_manager().acquire()?;
        let env = guard.env();
        let provider = rt.instantiate(&env, PROVIDER)?;
        bridge.adapters().bind_callback(handle, &env, provider)?;
        env.delete_local_ref(provider)?;
    }
    bridge.detach_current_thread_if_possible()?;
    let operator = bridge.adapters().operator(handle)?;
    info!(threads = plan.threads, calls = plan.calls, operator = operator.name(), "stress run starting");

    let started = Instant::now();
    let per_thread = thread::scope(|s| {
        let workers: Vec<_> = (0..plan.threads)
            .map(|t| {
                let operator = Arc::clone(&operator);
                let rt = &rt;
                s.spawn(move || {
                    let key = format!("thread-{t}").into_bytes();
                    let mut stats = ThreadStats {
                        thread: t,
                        attaches: 0,
                        detaches_before_exit: 0,
                        mismatches: 0,
                        failures: 0,
                    };
                    let Some(merge) = operator.as_associative() else {
                        stats.failures = plan.calls;
                        return stats;
                    };
                    for i in 0..plan.calls {
                        let value = i.to_le_bytes();
                        match merge.merge(&key, None, &value) {
                            Ok(out) if out == expected(&key, &value) => {}
                            Ok(_) => stats.mismatches += 1,
                            Err(_) => stats.failures += 1,
                        }
                    }
                    let me = thread::current().id();
                    stats.attaches = rt.attach_count(me);
                    stats.detaches_before_exit = rt.detach_count(me);
                    stats
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow::anyhow!("stress worker panicked")))
            .collect::<anyhow::Result<Vec<_>>>()
    })?;
    let elapsed = started.elapsed();

    let total_calls = (plan.threads * plan.calls) as f64;
    let secs = elapsed.as_secs_f64();
    let report = StressReport {
        operator: operator.name().to_string(),
        threads: plan.threads,
        calls_per_thread: plan.calls,
        policy: plan.policy.to_string(),
        retention: plan.retention.to_string(),
        elapsed_ms: secs * 1000.0,
        calls_per_sec: if secs > 0.0 { total_calls / secs } else { 0.0 },
        per_thread,
        live_local_refs: rt.live_local_refs(),
        total_attaches: rt.total_attaches(),
        total_detaches: rt.total_detaches(),
    };

    bridge.unload();
    Ok(report)
}
