// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The manager: binds a [`ManagerConfig`] to a [`ComponentList`], owns the
//! runtime (reactors, frame pool, task processors) and the component
//! container, and drives the signal-based run loop.
//!
//! Build order: logging, reactors, frame pool, processors, container.
//! Teardown is the reverse: components first (reverse construction order),
//! then the processors are drained, cancelled, stopped, and finally the
//! reactors.

use crate::components::{ComponentContext, ComponentList, MonitorVerbosity};
use crate::config::{ComponentConfig, ConfigSource, ManagerConfig};
use crate::error::Error;
use crate::exec::TaskProcessor;
use crate::logging::{self, LogHandle};
use crate::reactor::ReactorPool;
use crate::signal::{Signal, SignalListener};
use crate::task::{FramePool, FramePoolConfig};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::time::{Duration, Instant};

pub struct Manager {
    config: ManagerConfig,
    log: LogHandle,
    reactors: ReactorPool,
    frame_pool: std::sync::Arc<FramePool>,
    processors: HashMap<String, TaskProcessor>,
    context: ComponentContext,
    stopped: bool,
}

impl Manager {
    /// Build the runtime and construct every component. On a construction
    /// failure the partially built container is destroyed in reverse order
    /// and the error is returned.
    pub fn new(config: ManagerConfig, list: ComponentList) -> Result<Self, Error> {
        let log = logging::init(&config.logging)?;

        let mut reactors = ReactorPool::new(config.event_thread_pool.threads)?;
        let frame_pool = FramePool::new(FramePoolConfig {
            max_frames: config.task_frame_pool.max_frames,
            idle_limit: config.task_frame_pool.idle_limit,
        });

        let mut processors = HashMap::new();
        for processor_config in &config.task_processors {
            let built = TaskProcessor::build(
                processor_config,
                std::sync::Arc::clone(&frame_pool),
                reactors.handle(),
            );
            match built {
                Ok(processor) => {
                    processors.insert(processor_config.name.clone(), processor);
                }
                Err(err) => {
                    stop_runtime(&processors, &mut reactors);
                    return Err(err);
                }
            }
        }

        let Some(default_processor) = processors.get(&config.default_task_processor).cloned()
        else {
            stop_runtime(&processors, &mut reactors);
            return Err(Error::Invariant(
                "default_task_processor does not name a configured processor",
            ));
        };

        let configs: HashMap<String, ComponentConfig> = config
            .component_configs()
            .map(|component| (component.name().to_owned(), component))
            .collect();

        let context =
            ComponentContext::new(processors.clone(), default_processor, configs, list);

        if let Err(err) = context.build_all() {
            tracing::error!("component construction failed: {err}");
            context.teardown();
            stop_runtime(&processors, &mut reactors);
            return Err(err);
        }

        tracing::info!(
            components = context.construction_order().len(),
            processors = processors.len(),
            "manager ready",
        );

        Ok(Self {
            config,
            log,
            reactors,
            frame_pool,
            processors,
            context,
            stopped: false,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn context(&self) -> &ComponentContext {
        &self.context
    }

    pub fn frame_pool(&self) -> &std::sync::Arc<FramePool> {
        &self.frame_pool
    }

    /// Monitoring snapshot of every monitorable component.
    pub fn monitor_data(&self, verbosity: MonitorVerbosity) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        for (name, component) in self.context.monitorable_snapshot() {
            let value = match verbosity {
                MonitorVerbosity::Terse => serde_json::Value::Null,
                MonitorVerbosity::Full => component.monitor(),
            };
            data.insert(name, value);
        }
        serde_json::Value::Object(data)
    }

    /// Loop until `SIGINT`/`SIGTERM`, rotating logs on `SIGUSR1`, then tear
    /// everything down.
    pub fn run(mut self) -> Result<(), Error> {
        let signals = SignalListener::install()?;
        tracing::info!("running until termination signal");

        while let Some(signal) = signals.recv() {
            match signal {
                Signal::Terminate => {
                    tracing::info!("termination signal received");
                    break;
                }
                Signal::RotateLogs => {
                    if let Err(err) = self.log.rotate() {
                        tracing::error!("log rotation failed: {err}");
                    }
                }
                Signal::Hangup => {
                    tracing::debug!("SIGHUP ignored (reserved)");
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Construct, quiesce, and tear down — the testing mode.
    pub fn run_once(mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.shutdown_deadline();
        for processor in self.processors.values() {
            processor.wait_idle(deadline);
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_deadline_ms)
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        tracing::info!("shutting down");

        self.context.teardown();

        // Drain in-flight tasks up to the deadline, then cancel stragglers
        // and give them a moment to observe it.
        let deadline = Instant::now() + self.shutdown_deadline();
        let mut drained = true;
        for processor in self.processors.values() {
            drained &= processor.wait_idle(deadline);
        }
        if !drained {
            tracing::warn!("shutdown deadline reached, cancelling outstanding tasks");
            for processor in self.processors.values() {
                processor.cancel_all();
            }
            let grace = Instant::now() + Duration::from_millis(500);
            for processor in self.processors.values() {
                processor.wait_idle(grace);
            }
        }

        stop_runtime(&self.processors, &mut self.reactors);
        tracing::info!("manager stopped");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("processors", &self.processors.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

fn stop_runtime(processors: &HashMap<String, TaskProcessor>, reactors: &mut ReactorPool) {
    for processor in processors.values() {
        processor.stop();
    }
    for processor in processors.values() {
        processor.join();
    }
    reactors.stop_all();
}

/// Start a service: loop until a termination signal. Returns the process
/// exit code (`0` ok, `1` construction failure, `2` bad config, `3` panic
/// after startup).
pub fn run(source: impl Into<ConfigSource>, list: ComponentList) -> ExitCode {
    ExitCode::from(run_impl(source.into(), list, Manager::run))
}

/// Run the component list once: construct, quiesce, tear down.
pub fn run_once(source: impl Into<ConfigSource>, list: ComponentList) -> ExitCode {
    ExitCode::from(run_impl(source.into(), list, Manager::run_once))
}

fn run_impl(source: ConfigSource, list: ComponentList, mode: fn(Manager) -> Result<(), Error>) -> u8 {
    let config = match ManagerConfig::load(&source) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid config: {err}");
            return 2;
        }
    };

    let manager = match Manager::new(config, list) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("failed to start components: {err}");
            return 1;
        }
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| mode(manager))) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            eprintln!("runtime error: {err}");
            1
        }
        Err(_) => {
            eprintln!("unhandled panic after startup");
            3
        }
    }
}
