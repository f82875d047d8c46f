//! Module runtime: dependency-ordered lifecycle and per-module task queues.
//!
//! A module is a long-lived named unit with a start step, a stop step and a
//! declared dependency list. The registry starts modules dependency-first,
//! stops them in reverse start order, and treats every misuse (missing
//! dependency, double start, undeclared lookup) as a programming error that
//! aborts.
//!
//! Work addressed to a module travels through [`TaskQueue`]s. A module's
//! runner future is the sole consumer of its queues, which serializes all
//! callbacks destined for the module without locks.

use core::cell::RefCell;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::config;

/// Static identity of a module. Two descriptors are the same module if and
/// only if they are the same `static`.
pub struct ModuleDescriptor {
    name: &'static str,
}

impl ModuleDescriptor {
    /// A descriptor with a diagnostic name.
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// The module's diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn same(a: &'static ModuleDescriptor, b: &'static ModuleDescriptor) -> bool {
    core::ptr::eq(a, b)
}

/// A unit managed by the [`ModuleRegistry`].
///
/// `start` runs synchronous registration work (event subscriptions,
/// callback wiring); anything long-running belongs in the module's runner.
pub trait Module {
    /// The static identity of this module.
    fn descriptor(&self) -> &'static ModuleDescriptor;

    /// The modules this module requires; all of them are started before
    /// this module's `start` runs.
    fn dependencies(&self) -> &[&'static ModuleDescriptor] {
        &[]
    }

    /// Start step, run after all dependencies have started.
    fn start(&self) {}

    /// Stop step, run in reverse start order.
    fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ModuleState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Entry<'d> {
    module: &'d dyn Module,
    state: ModuleState,
}

struct RegistryState<'d> {
    modules: Vec<Entry<'d>, { config::MAX_MODULES }>,
    start_order: Vec<usize, { config::MAX_MODULES }>,
}

/// Ordered container of started modules.
///
/// Not thread-safe: `start` and `stop_all` must run before any module
/// callbacks execute and after they have ceased, respectively.
pub struct ModuleRegistry<'d> {
    state: RefCell<RegistryState<'d>>,
}

impl<'d> Default for ModuleRegistry<'d> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d> ModuleRegistry<'d> {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            state: RefCell::new(RegistryState {
                modules: Vec::new(),
                start_order: Vec::new(),
            }),
        }
    }

    /// Start every provided module, dependencies first.
    ///
    /// Every module in the transitive dependency closure of `roots` must be
    /// present in `roots`; a missing dependency, a dependency cycle, or a
    /// module that is already started is a contract violation.
    pub fn start(&self, roots: &[&'d dyn Module]) {
        {
            let mut state = self.state.borrow_mut();
            for module in roots {
                let descriptor = module.descriptor();
                assert!(
                    !state.modules.iter().any(|e| same(e.module.descriptor(), descriptor)),
                    "module {} started twice",
                    descriptor.name()
                );
                unwrap!(
                    state
                        .modules
                        .push(Entry {
                            module: *module,
                            state: ModuleState::Unstarted,
                        })
                        .ok(),
                    "module registry full"
                );
            }
        }
        for module in roots {
            self.start_module(module.descriptor());
        }
    }

    fn start_module(&self, descriptor: &'static ModuleDescriptor) {
        let (index, module) = {
            let mut state = self.state.borrow_mut();
            let index = unwrap!(
                state
                    .modules
                    .iter()
                    .position(|e| same(e.module.descriptor(), descriptor)),
                "dependency {} was not provided to the registry",
                descriptor.name()
            );
            let entry = &mut state.modules[index];
            match entry.state {
                ModuleState::Running => return,
                ModuleState::Unstarted => {}
                ModuleState::Starting => panic!("dependency cycle through module {}", descriptor.name()),
                _ => panic!("module {} restarted after stop", descriptor.name()),
            }
            entry.state = ModuleState::Starting;
            (index, entry.module)
        };

        for dep in module.dependencies() {
            self.start_module(dep);
        }

        debug!("[runtime] starting module {}", descriptor.name());
        module.start();

        let mut state = self.state.borrow_mut();
        state.modules[index].state = ModuleState::Running;
        unwrap!(state.start_order.push(index).ok());
    }

    /// Stop all modules in reverse start order. The registry is empty
    /// afterwards.
    pub fn stop_all(&self) {
        loop {
            let module = {
                let mut state = self.state.borrow_mut();
                let Some(index) = state.start_order.pop() else {
                    state.modules.clear();
                    return;
                };
                let entry = &mut state.modules[index];
                assert!(entry.state == ModuleState::Running);
                entry.state = ModuleState::Stopping;
                entry.module
            };
            debug!("[runtime] stopping module {}", module.descriptor().name());
            module.stop();
            let mut state = self.state.borrow_mut();
            let index = unwrap!(state
                .modules
                .iter()
                .position(|e| same(e.module.descriptor(), module.descriptor())));
            state.modules[index].state = ModuleState::Stopped;
        }
    }

    /// Look up a started module. Absence is a contract violation.
    pub fn get(&self, descriptor: &'static ModuleDescriptor) -> &'d dyn Module {
        let state = self.state.borrow();
        let entry = unwrap!(
            state
                .modules
                .iter()
                .find(|e| same(e.module.descriptor(), descriptor) && e.state == ModuleState::Running),
            "module {} is not started",
            descriptor.name()
        );
        entry.module
    }

    /// Look up a dependency on behalf of `caller`. The descriptor must be
    /// in `caller`'s declared dependency list.
    pub fn get_dependency(&self, caller: &dyn Module, descriptor: &'static ModuleDescriptor) -> &'d dyn Module {
        assert!(
            caller.dependencies().iter().any(|d| same(d, descriptor)),
            "module {} did not declare {} as a dependency",
            caller.descriptor().name(),
            descriptor.name()
        );
        self.get(descriptor)
    }

    /// Whether a module is currently running.
    pub fn is_started(&self, descriptor: &'static ModuleDescriptor) -> bool {
        let state = self.state.borrow();
        state
            .modules
            .iter()
            .any(|e| same(e.module.descriptor(), descriptor) && e.state == ModuleState::Running)
    }
}

/// A serialized FIFO of work items addressed to one module.
///
/// Any context may post; the owning module's runner is the single
/// consumer.
pub struct TaskQueue<T, const N: usize> {
    channel: Channel<NoopRawMutex, T, N>,
}

impl<T, const N: usize> Default for TaskQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> TaskQueue<T, N> {
    /// An empty queue.
    pub const fn new() -> Self {
        Self { channel: Channel::new() }
    }

    /// Post an item, waiting for space.
    pub async fn post(&self, item: T) {
        self.channel.send(item).await
    }

    /// Post an item if there is space, handing it back otherwise.
    pub fn try_post(&self, item: T) -> Result<(), T> {
        self.channel.try_send(item).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(item) => item,
        })
    }

    /// Take the next item, waiting for one to arrive.
    pub async fn receive(&self) -> T {
        self.channel.receive().await
    }

    /// Take the next item if one is queued.
    pub fn try_receive(&self) -> Option<T> {
        self.channel.try_receive().ok()
    }

    /// Poll for the next item.
    pub fn poll_receive(&self, cx: &mut Context<'_>) -> Poll<T> {
        self.channel.poll_receive(cx)
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::string::String;
    use std::vec::Vec;

    use super::*;

    struct Recorder {
        log: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn new() -> &'static Recorder {
            Box::leak(Box::new(Recorder {
                log: RefCell::new(Vec::new()),
            }))
        }

        fn record(&self, what: &str, name: &str) {
            let mut entry = String::from(what);
            entry.push(' ');
            entry.push_str(name);
            self.log.borrow_mut().push(entry);
        }
    }

    struct TestModule {
        descriptor: &'static ModuleDescriptor,
        deps: &'static [&'static ModuleDescriptor],
        recorder: &'static Recorder,
    }

    impl TestModule {
        fn new(
            descriptor: &'static ModuleDescriptor,
            deps: &'static [&'static ModuleDescriptor],
            recorder: &'static Recorder,
        ) -> &'static TestModule {
            Box::leak(Box::new(TestModule {
                descriptor,
                deps,
                recorder,
            }))
        }
    }

    impl Module for TestModule {
        fn descriptor(&self) -> &'static ModuleDescriptor {
            self.descriptor
        }

        fn dependencies(&self) -> &[&'static ModuleDescriptor] {
            self.deps
        }

        fn start(&self) {
            self.recorder.record("start", self.descriptor.name());
        }

        fn stop(&self) {
            self.recorder.record("stop", self.descriptor.name());
        }
    }

    static A: ModuleDescriptor = ModuleDescriptor::new("a");
    static B: ModuleDescriptor = ModuleDescriptor::new("b");
    static C: ModuleDescriptor = ModuleDescriptor::new("c");

    static DEPS_A: [&ModuleDescriptor; 1] = [&A];
    static DEPS_B: [&ModuleDescriptor; 1] = [&B];

    #[test]
    fn dependencies_start_first_and_stop_reversed() {
        let recorder = Recorder::new();
        // c depends on b, b depends on a; provide in reverse order.
        let a = TestModule::new(&A, &[], recorder);
        let b = TestModule::new(&B, &DEPS_A, recorder);
        let c = TestModule::new(&C, &DEPS_B, recorder);

        let registry = ModuleRegistry::new();
        registry.start(&[c, b, a]);

        assert!(registry.is_started(&A));
        assert!(registry.is_started(&B));
        assert!(registry.is_started(&C));

        registry.stop_all();
        assert!(!registry.is_started(&A));

        let log = recorder.log.borrow();
        assert_eq!(
            log.as_slice(),
            &["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }

    #[test]
    fn get_returns_started_module() {
        let recorder = Recorder::new();
        let a = TestModule::new(&A, &[], recorder);
        let registry = ModuleRegistry::new();
        registry.start(&[a]);
        assert!(same(registry.get(&A).descriptor(), &A));
    }

    #[test]
    #[should_panic]
    fn get_unstarted_module_panics() {
        let recorder = Recorder::new();
        let a = TestModule::new(&A, &[], recorder);
        let registry = ModuleRegistry::new();
        registry.start(&[a]);
        registry.get(&B);
    }

    #[test]
    #[should_panic]
    fn missing_dependency_panics() {
        let recorder = Recorder::new();
        let b = TestModule::new(&B, &DEPS_A, recorder);
        let registry = ModuleRegistry::new();
        registry.start(&[b]);
    }

    #[test]
    #[should_panic]
    fn double_start_panics() {
        let recorder = Recorder::new();
        let a = TestModule::new(&A, &[], recorder);
        let registry = ModuleRegistry::new();
        registry.start(&[a]);
        registry.start(&[a]);
    }

    #[test]
    #[should_panic]
    fn undeclared_dependency_lookup_panics() {
        let recorder = Recorder::new();
        let a = TestModule::new(&A, &[], recorder);
        let b = TestModule::new(&B, &[], recorder);
        let registry = ModuleRegistry::new();
        registry.start(&[a, b]);
        // b never declared a.
        registry.get_dependency(b, &A);
    }

    #[test]
    fn task_queue_is_fifo() {
        let queue: TaskQueue<u32, 4> = TaskQueue::new();
        assert!(queue.try_post(1).is_ok());
        assert!(queue.try_post(2).is_ok());
        assert_eq!(queue.try_receive(), Some(1));
        assert_eq!(queue.try_receive(), Some(2));
        assert_eq!(queue.try_receive(), None);
    }

    #[test]
    fn task_queue_overflow_hands_item_back() {
        let queue: TaskQueue<u32, 2> = TaskQueue::new();
        assert!(queue.try_post(1).is_ok());
        assert!(queue.try_post(2).is_ok());
        assert_eq!(queue.try_post(3), Err(3));
    }
}
