//! Simulation runner
//!
//! Drives one world: each agent loop artifact runs in its own task,
//! invoking itself through the kernel on a delay that backs off on
//! retriable failures. A shared upkeep task advances the mint schedule
//! and emits periodic summary snapshots. All tasks share the world
//! behind one async mutex; actions are short and synchronous, so the
//! lock is never held across an await.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use agora_world::World;

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Clone, Copy)]
struct LoopSettings {
    min_delay: Duration,
    max_delay: Duration,
    max_consecutive_errors: u32,
    check_interval: Duration,
}

/// Final per-loop accounting, reported in `simulation_stopped`.
struct LoopStats {
    loop_id: String,
    owner: String,
    iterations: u64,
    errors: u64,
    last_error: Option<String>,
    frozen: bool,
}

impl LoopStats {
    fn to_json(&self) -> Value {
        json!({
            "owner": self.owner,
            "iterations": self.iterations,
            "errors": self.errors,
            "last_error": self.last_error,
            "frozen": self.frozen,
        })
    }
}

/// Owns the shared world and the lifecycle of one simulation run.
pub struct SimulationRunner {
    world: Arc<Mutex<World>>,
    paused: watch::Sender<bool>,
    stop: watch::Sender<bool>,
}

impl SimulationRunner {
    pub fn new(world: World) -> Self {
        let (paused, _) = watch::channel(false);
        let (stop, _) = watch::channel(false);
        Self {
            world: Arc::new(Mutex::new(world)),
            paused,
            stop,
        }
    }

    /// Shared handle; useful for inspecting state mid-run.
    pub fn world(&self) -> Arc<Mutex<World>> {
        self.world.clone()
    }

    /// Pause all agent loops. Upkeep (mint, summaries) keeps running.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// End the run before its duration elapses.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Run the simulation to completion. `duration` defaults to the
    /// configured run length and is always capped by the configured
    /// maximum runtime.
    pub async fn run(&self, duration: Option<Duration>) {
        let (run_duration, capped, settings, summary_interval, loops) = {
            let mut world = self.world.lock().await;
            let sim = &world.config.simulation;
            let requested =
                duration.unwrap_or(Duration::from_secs_f64(sim.default_duration_seconds));
            let limit = Duration::from_secs_f64(sim.max_runtime_seconds);
            let settings = LoopSettings {
                min_delay: Duration::from_secs_f64(sim.agent_loop.min_delay_seconds.max(0.01)),
                max_delay: Duration::from_secs_f64(sim.agent_loop.max_delay_seconds.max(0.01)),
                max_consecutive_errors: sim.agent_loop.max_consecutive_errors.max(1),
                check_interval: Duration::from_secs_f64(
                    sim.agent_loop.resource_check_interval_seconds.max(0.01),
                ),
            };
            let summary_interval = Duration::from_secs_f64(sim.summary_interval_seconds.max(0.01));
            let loops: Vec<(String, String)> = world
                .store
                .discover_loops()
                .into_iter()
                .filter_map(|loop_id| {
                    world
                        .store
                        .get(&loop_id)
                        .map(|a| (loop_id.clone(), a.owner.clone()))
                })
                .collect();

            let event = json!({
                "event_number": world.event_number,
                "run_id": world.run_id,
                "loop_count": loops.len(),
                "duration_seconds": requested.min(limit).as_secs_f64(),
            });
            world.log.log("simulation_started", fields(event));
            (
                requested.min(limit),
                requested > limit,
                settings,
                summary_interval,
                loops,
            )
        };

        info!(
            loops = loops.len(),
            duration_seconds = run_duration.as_secs_f64(),
            "simulation starting"
        );

        let mut handles: Vec<JoinHandle<LoopStats>> = Vec::new();
        for (loop_id, owner) in loops {
            handles.push(tokio::spawn(agent_task(
                self.world.clone(),
                loop_id,
                owner,
                settings,
                self.paused.subscribe(),
                self.stop.subscribe(),
            )));
        }
        let upkeep = tokio::spawn(upkeep_task(
            self.world.clone(),
            summary_interval,
            settings.check_interval,
            self.stop.subscribe(),
        ));

        let mut stop_rx = self.stop.subscribe();
        let timed_out = tokio::select! {
            _ = sleep(run_duration) => true,
            _ = wait_for_stop(&mut stop_rx) => false,
        };
        let _ = self.stop.send(true);

        let mut stats = Vec::new();
        for handle in handles {
            if let Ok(s) = handle.await {
                stats.push(s);
            }
        }
        let _ = upkeep.await;

        let mut world = self.world.lock().await;
        if timed_out && capped {
            let event = json!({
                "event_number": world.event_number,
                "run_id": world.run_id,
                "max_runtime_seconds": world.config.simulation.max_runtime_seconds,
            });
            world.log.log("simulation_runtime_limit_reached", fields(event));
        }
        world.log_summary_snapshot();
        let loops: Map<String, Value> = stats
            .iter()
            .map(|s| (s.loop_id.clone(), s.to_json()))
            .collect();
        let event = json!({
            "event_number": world.event_number,
            "run_id": world.run_id,
            "duration_seconds": run_duration.as_secs_f64(),
            "loops": loops,
        });
        world.log.log("simulation_stopped", fields(event));
        info!(
            run_id = %world.run_id,
            events = world.event_number,
            "simulation stopped"
        );
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One agent's autonomous turn loop. Retriable failures back off
/// exponentially; persistent failure freezes the agent, and frozen
/// agents poll instead of acting until something unfreezes them.
async fn agent_task(
    world: Arc<Mutex<World>>,
    loop_id: String,
    owner: String,
    settings: LoopSettings,
    paused: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
) -> LoopStats {
    let mut stats = LoopStats {
        loop_id: loop_id.clone(),
        owner: owner.clone(),
        iterations: 0,
        errors: 0,
        last_error: None,
        frozen: false,
    };
    let mut delay = settings.min_delay;
    let mut consecutive_errors = 0u32;
    let mut frozen_for_budget = false;
    let intent = json!({
        "action_type": "invoke_artifact",
        "artifact_id": loop_id,
        "method": "run",
    });

    loop {
        if *stop.borrow() {
            break;
        }
        if *paused.borrow() {
            sleep(settings.check_interval).await;
            continue;
        }
        {
            let mut world = world.lock().await;
            let budget = world.ledger.llm_budget(&owner);
            if frozen_for_budget && budget > 0.0 {
                // Budget replenished; the agent may act again.
                world.unfreeze_agent(&owner);
                frozen_for_budget = false;
                info!(agent = %owner, budget, "agent unfrozen");
            } else if !world.is_frozen(&owner) && budget <= 0.0 {
                world.freeze_agent(&owner);
                frozen_for_budget = true;
                let event = json!({
                    "event_number": world.event_number,
                    "agent_id": owner,
                    "loop_id": loop_id,
                    "reason": "llm_budget_exhausted",
                });
                world.log.log("agent_frozen", fields(event));
                warn!(agent = %owner, "agent frozen: llm budget exhausted");
            }
            stats.frozen = world.is_frozen(&owner);
        }
        if stats.frozen {
            sleep(settings.check_interval).await;
            continue;
        }

        let result = {
            let mut world = world.lock().await;
            world.execute_action_data(&owner, &intent, true)
        };
        stats.iterations += 1;

        if result.success {
            consecutive_errors = 0;
            delay = settings.min_delay;
        } else {
            consecutive_errors += 1;
            stats.errors += 1;
            stats.last_error = Some(result.message.clone());
            debug!(
                agent = %owner,
                errors = consecutive_errors,
                error = %result.message,
                "loop turn failed"
            );
            if result.retriable {
                delay = (delay * 2).min(settings.max_delay);
                let mut world = world.lock().await;
                let event = json!({
                    "event_number": world.event_number,
                    "agent_id": owner,
                    "loop_id": loop_id,
                    "error": result.message,
                    "delay_seconds": delay.as_secs_f64(),
                });
                world.log.log("loop_paused_error_backoff", fields(event));
            }
            if consecutive_errors >= settings.max_consecutive_errors {
                let mut world = world.lock().await;
                world.freeze_agent(&owner);
                stats.frozen = true;
                let event = json!({
                    "event_number": world.event_number,
                    "agent_id": owner,
                    "loop_id": loop_id,
                    "consecutive_errors": consecutive_errors,
                });
                world.log.log("agent_frozen", fields(event));
                warn!(agent = %owner, "agent frozen after repeated failures");
                consecutive_errors = 0;
            }
        }
        sleep(delay).await;
    }
    stats
}

/// Mint schedule and periodic summaries.
async fn upkeep_task(
    world: Arc<Mutex<World>>,
    summary_interval: Duration,
    tick_interval: Duration,
    stop: watch::Receiver<bool>,
) {
    let mut since_summary = Duration::ZERO;
    loop {
        if *stop.borrow() {
            break;
        }
        sleep(tick_interval).await;
        since_summary += tick_interval;

        let mut world = world.lock().await;
        if let Some(resolution) = world.tick() {
            info!(result = %resolution, "mint auction resolved");
        }
        if since_summary >= summary_interval {
            world.log_summary_snapshot();
            since_summary = Duration::ZERO;
        }
    }
}
