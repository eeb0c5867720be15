// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The component container: named long-lived singletons constructed via
//! dependency injection.
//!
//! Construction is single-threaded and demand-driven: building a component
//! recursively constructs whatever it [`ComponentContext::find_component`]s,
//! recording the topological order as it goes; a cycle fails fatally.
//! Once every component is built the container freezes — lookups go through
//! a read-only view without taking a lock — and teardown happens strictly in
//! reverse construction order.

use crate::config::ComponentConfig;
use crate::error::Error;
use crate::exec::TaskProcessor;
use crate::reactor::ReactorHandle;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

/// A named long-lived singleton managed by the container.
pub trait Component: Any + Send + Sync {
    /// Called once after every component finished construction, in
    /// construction order.
    fn on_all_components_loaded(&self) {}

    /// Called at the start of teardown, in reverse construction order. Must
    /// not reach for components constructed later than this one.
    fn on_all_components_are_stopping(&self) {}
}

/// A component that exposes a monitoring snapshot.
pub trait Monitorable: Component {
    fn monitor(&self) -> serde_json::Value;
}

/// Constructor interface components implement to be registered in a
/// [`ComponentList`].
pub trait ComponentFactory: Component + Sized {
    /// Default registration name.
    const NAME: &'static str;

    fn new(config: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorVerbosity {
    Terse,
    Full,
}

type BuildFn =
    Box<dyn Fn(&ComponentConfig, &ComponentContext) -> Result<Arc<dyn Component>, Error> + Send + Sync>;
type MonitorCast = fn(&Arc<dyn Component>) -> Option<Arc<dyn Monitorable>>;

struct Registration {
    name: String,
    build: BuildFn,
    monitor_cast: Option<MonitorCast>,
}

fn monitor_cast_for<C: Monitorable>(component: &Arc<dyn Component>) -> Option<Arc<dyn Monitorable>> {
    let any: Arc<dyn Any + Send + Sync> = Arc::clone(component) as Arc<dyn Any + Send + Sync>;
    any.downcast::<C>()
        .ok()
        .map(|concrete| concrete as Arc<dyn Monitorable>)
}

/// Ordered set of component registrations handed to the manager.
#[derive(Default)]
pub struct ComponentList {
    registrations: Vec<Registration>,
}

impl ComponentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<C: ComponentFactory>(self) -> Self {
        self.append_named::<C>(C::NAME)
    }

    pub fn append_named<C: ComponentFactory>(mut self, name: &str) -> Self {
        self.registrations.push(Registration {
            name: name.to_owned(),
            build: Box::new(|config, context| {
                Ok(Arc::new(C::new(config, context)?) as Arc<dyn Component>)
            }),
            monitor_cast: None,
        });
        self
    }

    pub fn append_monitorable<C: ComponentFactory + Monitorable>(mut self) -> Self {
        self.registrations.push(Registration {
            name: C::NAME.to_owned(),
            build: Box::new(|config, context| {
                Ok(Arc::new(C::new(config, context)?) as Arc<dyn Component>)
            }),
            monitor_cast: Some(monitor_cast_for::<C>),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for ComponentList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.registrations.iter().map(|r| r.name.as_str()).collect();
        f.debug_struct("ComponentList").field("components", &names).finish()
    }
}

/// Construction-phase bookkeeping, dropped when the container freezes.
struct BuildState {
    registrations: HashMap<String, Registration>,
    list_order: Vec<String>,
    /// Names currently being constructed, outermost first. The cycle check.
    stack: Vec<String>,
    builder: ThreadId,
}

struct ContextInner {
    processors: HashMap<String, TaskProcessor>,
    default_processor: TaskProcessor,
    configs: HashMap<String, ComponentConfig>,
    /// The source of truth. Mutated only before freeze and at teardown.
    components: Mutex<HashMap<String, Arc<dyn Component>>>,
    /// Construction order, set as factories complete.
    order: Mutex<Vec<String>>,
    build: Mutex<Option<BuildState>>,
    /// Lock-free lookup view, installed at freeze.
    frozen: OnceLock<HashMap<String, Weak<dyn Component>>>,
    monitorables: Mutex<Vec<(String, Arc<dyn Monitorable>)>>,
}

/// Handle to the component container; passed to factories and retained by
/// components that look things up at runtime.
#[derive(Clone)]
pub struct ComponentContext {
    inner: Arc<ContextInner>,
}

impl ComponentContext {
    pub(crate) fn new(
        processors: HashMap<String, TaskProcessor>,
        default_processor: TaskProcessor,
        configs: HashMap<String, ComponentConfig>,
        list: ComponentList,
    ) -> Self {
        let list_order: Vec<String> =
            list.registrations.iter().map(|r| r.name.clone()).collect();
        let registrations = list
            .registrations
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        Self {
            inner: Arc::new(ContextInner {
                processors,
                default_processor,
                configs,
                components: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                build: Mutex::new(Some(BuildState {
                    registrations,
                    list_order,
                    stack: Vec::new(),
                    builder: std::thread::current().id(),
                })),
                frozen: OnceLock::new(),
                monitorables: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Look up a component by name and concrete type.
    ///
    /// During construction this *recursively constructs* missing
    /// dependencies and records the edge; after freeze it is a plain
    /// read-only lookup.
    pub fn find_component<T: Component>(&self, name: &str) -> Result<Arc<T>, Error> {
        let raw = self.find_raw(name)?;
        let any: Arc<dyn Any + Send + Sync> = raw;
        any.downcast::<T>()
            .map_err(|_| Error::Invariant("component found under this name has another type"))
    }

    fn find_raw(&self, name: &str) -> Result<Arc<dyn Component>, Error> {
        if let Some(frozen) = self.inner.frozen.get() {
            return frozen
                .get(name)
                .and_then(Weak::upgrade)
                .ok_or_else(|| Error::DependencyMissing(name.to_owned()));
        }
        self.ensure_built(name)
    }

    fn ensure_built(&self, name: &str) -> Result<Arc<dyn Component>, Error> {
        let registration = {
            let mut guard = self.inner.build.lock();
            let state = guard
                .as_mut()
                .ok_or(Error::Invariant("container already frozen"))?;
            if state.builder != std::thread::current().id() {
                return Err(Error::Invariant(
                    "find_component during construction from a non-builder thread",
                ));
            }
            {
                let components = self.inner.components.lock();
                if let Some(existing) = components.get(name) {
                    return Ok(Arc::clone(existing));
                }
            }
            if state.stack.iter().any(|n| n == name) {
                let mut cycle = state.stack.clone();
                cycle.push(name.to_owned());
                return Err(Error::DependencyCycle(cycle));
            }
            let Some(registration) = state.registrations.remove(name) else {
                return Err(Error::DependencyMissing(name.to_owned()));
            };
            state.stack.push(name.to_owned());
            registration
        };

        let config = self
            .inner
            .configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| ComponentConfig::empty(name));

        tracing::info!(component = name, "constructing");
        let result = (registration.build)(&config, self);

        let mut guard = self.inner.build.lock();
        if let Some(state) = guard.as_mut() {
            state.stack.pop();
        }
        drop(guard);

        match result {
            Ok(instance) => {
                if let Some(cast) = registration.monitor_cast
                    && let Some(monitorable) = cast(&instance)
                {
                    self.inner
                        .monitorables
                        .lock()
                        .push((name.to_owned(), monitorable));
                }
                self.inner
                    .components
                    .lock()
                    .insert(name.to_owned(), Arc::clone(&instance));
                self.inner.order.lock().push(name.to_owned());
                Ok(instance)
            }
            Err(err) => {
                tracing::error!(component = name, "construction failed: {err}");
                Err(err)
            }
        }
    }

    /// Build every registered component in list order (pulling dependencies
    /// first), then freeze the container and run the loaded hooks.
    pub(crate) fn build_all(&self) -> Result<(), Error> {
        let names = {
            let guard = self.inner.build.lock();
            let state = guard
                .as_ref()
                .ok_or(Error::Invariant("container already frozen"))?;
            state.list_order.clone()
        };

        for name in &names {
            self.ensure_built(name)?;
        }

        *self.inner.build.lock() = None;

        let frozen: HashMap<String, Weak<dyn Component>> = {
            let components = self.inner.components.lock();
            components
                .iter()
                .map(|(name, component)| (name.clone(), Arc::downgrade(component)))
                .collect()
        };
        let _ = self.inner.frozen.set(frozen);

        let order = self.inner.order.lock().clone();
        for name in &order {
            let component = self.inner.components.lock().get(name).cloned();
            if let Some(component) = component {
                component.on_all_components_loaded();
            }
        }

        Ok(())
    }

    /// Destroy components in reverse construction order. Also used to unwind
    /// a partially constructed container after a factory failure.
    pub(crate) fn teardown(&self) {
        let order: Vec<String> = std::mem::take(&mut *self.inner.order.lock());

        for name in order.iter().rev() {
            let component = self.inner.components.lock().get(name).cloned();
            if let Some(component) = component {
                component.on_all_components_are_stopping();
            }
        }

        self.inner.monitorables.lock().clear();

        for name in order.iter().rev() {
            if let Some(component) = self.inner.components.lock().remove(name) {
                drop(component);
                tracing::info!(component = %name, "stopped");
            }
        }
    }

    /// The monitorable components, `{name -> component}`.
    pub fn monitorable_snapshot(&self) -> Vec<(String, Arc<dyn Monitorable>)> {
        self.inner.monitorables.lock().clone()
    }

    /// Construction order so far; the container's topological order once
    /// frozen.
    pub fn construction_order(&self) -> Vec<String> {
        self.inner.order.lock().clone()
    }

    pub fn task_processor(&self, name: &str) -> Result<&TaskProcessor, Error> {
        self.inner
            .processors
            .get(name)
            .ok_or(Error::Invariant("no task processor with this name"))
    }

    pub fn default_task_processor(&self) -> &TaskProcessor {
        &self.inner.default_processor
    }

    pub fn reactor(&self) -> &ReactorHandle {
        self.inner.default_processor.reactor()
    }
}

impl std::fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentContext")
            .field("components", &self.inner.components.lock().len())
            .field("frozen", &self.inner.frozen.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::fixture;
    use parking_lot::Mutex;

    fn context_for(list: ComponentList, rt: &crate::test_util::TestRuntime) -> ComponentContext {
        let mut processors = HashMap::new();
        processors.insert("main".to_owned(), rt.processor.clone());
        ComponentContext::new(processors, rt.processor.clone(), HashMap::new(), list)
    }

    #[test]
    fn empty_container_builds_and_tears_down() {
        let rt = fixture();
        let context = context_for(ComponentList::new(), &rt);
        context.build_all().unwrap();
        assert!(context.construction_order().is_empty());
        context.teardown();
    }

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        log: EventLog,
    }

    impl Component for Probe {}

    impl Drop for Probe {
        fn drop(&mut self) {
            self.log.lock().push(format!("drop {}", self.name));
        }
    }

    // Component graph: alpha -> bravo -> charlie. Registrations carry the
    // shared log through a thread-local because factories only receive
    // config and context.
    thread_local! {
        static LOG: std::cell::RefCell<Option<EventLog>> = const { std::cell::RefCell::new(None) };
    }

    fn probe(name: &'static str) -> Probe {
        let log = LOG.with(|l| l.borrow().clone().unwrap());
        log.lock().push(format!("build {name}"));
        Probe { name, log }
    }

    struct Alpha(Probe);
    impl Component for Alpha {}
    impl ComponentFactory for Alpha {
        const NAME: &'static str = "alpha";
        fn new(_: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
            context.find_component::<Bravo>("bravo")?;
            Ok(Self(probe("alpha")))
        }
    }

    struct Bravo(Probe);
    impl Component for Bravo {}
    impl ComponentFactory for Bravo {
        const NAME: &'static str = "bravo";
        fn new(_: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
            context.find_component::<Charlie>("charlie")?;
            Ok(Self(probe("bravo")))
        }
    }

    struct Charlie(Probe);
    impl Component for Charlie {}
    impl ComponentFactory for Charlie {
        const NAME: &'static str = "charlie";
        fn new(_: &ComponentConfig, _: &ComponentContext) -> Result<Self, Error> {
            Ok(Self(probe("charlie")))
        }
    }

    #[test]
    fn recursive_construction_and_reverse_teardown() {
        let rt = fixture();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        LOG.with(|l| *l.borrow_mut() = Some(Arc::clone(&log)));

        let list = ComponentList::new()
            .append::<Alpha>()
            .append::<Bravo>()
            .append::<Charlie>();
        let context = context_for(list, &rt);
        context.build_all().unwrap();

        assert_eq!(context.construction_order(), ["charlie", "bravo", "alpha"]);

        let alpha = context.find_component::<Alpha>("alpha").unwrap();
        assert_eq!(alpha.0.name, "alpha");
        drop(alpha);

        context.teardown();
        LOG.with(|l| *l.borrow_mut() = None);

        assert_eq!(
            *log.lock(),
            [
                "build charlie",
                "build bravo",
                "build alpha",
                "drop alpha",
                "drop bravo",
                "drop charlie",
            ]
        );
    }

    struct Ouroboros;
    impl Component for Ouroboros {}
    impl ComponentFactory for Ouroboros {
        const NAME: &'static str = "ouroboros";
        fn new(_: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
            context.find_component::<Ouroboros>("ouroboros")?;
            Ok(Self)
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let rt = fixture();
        let context = context_for(ComponentList::new().append::<Ouroboros>(), &rt);
        match context.build_all() {
            Err(Error::DependencyCycle(stack)) => {
                assert_eq!(stack, ["ouroboros", "ouroboros"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        context.teardown();
    }

    struct Needy;
    impl Component for Needy {}
    impl ComponentFactory for Needy {
        const NAME: &'static str = "needy";
        fn new(_: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
            context.find_component::<Charlie>("nonexistent")?;
            Ok(Self)
        }
    }

    #[test]
    fn missing_dependency_fails_construction() {
        let rt = fixture();
        let context = context_for(ComponentList::new().append::<Needy>(), &rt);
        assert!(matches!(
            context.build_all(),
            Err(Error::DependencyMissing(name)) if name == "nonexistent"
        ));
        context.teardown();
    }

    struct Gauge;
    impl Component for Gauge {}
    impl Monitorable for Gauge {
        fn monitor(&self) -> serde_json::Value {
            serde_json::json!({ "healthy": true })
        }
    }
    impl ComponentFactory for Gauge {
        const NAME: &'static str = "gauge";
        fn new(_: &ComponentConfig, _: &ComponentContext) -> Result<Self, Error> {
            Ok(Self)
        }
    }

    #[test]
    fn monitorable_components_appear_in_the_snapshot() {
        let rt = fixture();
        let context = context_for(ComponentList::new().append_monitorable::<Gauge>(), &rt);
        context.build_all().unwrap();

        let snapshot = context.monitorable_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "gauge");
        assert_eq!(snapshot[0].1.monitor(), serde_json::json!({ "healthy": true }));

        context.teardown();
        assert!(context.monitorable_snapshot().is_empty());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let rt = fixture();
        let context = context_for(ComponentList::new().append::<Charlie>(), &rt);
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        LOG.with(|l| *l.borrow_mut() = Some(log));
        context.build_all().unwrap();
        assert!(matches!(
            context.find_component::<Alpha>("charlie"),
            Err(Error::Invariant(_))
        ));
        context.teardown();
        LOG.with(|l| *l.borrow_mut() = None);
    }
}
