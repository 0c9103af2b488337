//! Hooks installed while calls to the target are live on other threads.

use std::sync::{Arc, Barrier};
use std::thread;

use detour_core::{ObjectRef, Value};
use detour_runtime::{AccessFlags, ClassDef, ClassLoaderId, CodeItem, DexFile, MethodDef, MethodRef};
use detour_vm::{ManagedThread, QuickOutcome, Runtime, RuntimeConfig, TableInterpreter, quick_code};

const JOB: &str = "Lcom/example/Job;";
const HOOKED: Value = Value::Int(-1);

struct Fixture {
    runtime: Arc<Runtime>,
    interpreter: Arc<TableInterpreter>,
    park: MethodRef,
    outer: MethodRef,
    main: Arc<ManagedThread>,
}

// Job { static int park(int); static int outer() }
fn fixture() -> Fixture {
    let interpreter = Arc::new(TableInterpreter::new());
    let runtime = Arc::new(
        Runtime::builder(RuntimeConfig::for_testing())
            .with_interpreter(interpreter.clone())
            .build(),
    );

    let mut b = DexFile::builder("job.dex");
    let park_idx = b.add_method(JOB, "park", "I", &["I"]);
    let outer_idx = b.add_method(JOB, "outer", "I", &[]);
    let park_code = b.add_code_item(CodeItem::new(1, 1, vec![0x000f]));
    let outer_code = b.add_code_item(CodeItem::new(1, 0, vec![0x000f]));
    let class = runtime
        .linker()
        .define_class(
            ClassDef::new(ClassLoaderId::BOOT, b.build(), JOB)
                .with_method(MethodDef::new(park_idx, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(park_code))
                .with_method(MethodDef::new(outer_idx, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(outer_code)),
        )
        .unwrap();
    let park = class.direct_methods()[0].clone();
    let outer = class.direct_methods()[1].clone();

    runtime.set_hook_handler(|_cx, _call| Ok(HOOKED)).unwrap();
    runtime.start();
    let main = runtime.attach_thread("main");
    Fixture {
        runtime,
        interpreter,
        park,
        outer,
        main,
    }
}

/// Two-step rendezvous: the worker parks, the main thread hooks, then the
/// worker is released.
#[derive(Clone)]
struct Gate {
    parked: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl Gate {
    fn new() -> Self {
        Self {
            parked: Arc::new(Barrier::new(2)),
            release: Arc::new(Barrier::new(2)),
        }
    }

    fn hold(&self) {
        self.parked.wait();
        self.release.wait();
    }
}

struct WorkerReport {
    result: detour_core::VmResult<Value>,
    frames_rewritten: u64,
    deoptimizations: u64,
}

fn spawn_worker(f: &Fixture, method: &MethodRef, args: Vec<Value>) -> thread::JoinHandle<WorkerReport> {
    let runtime = Arc::clone(&f.runtime);
    let method = method.clone();
    thread::spawn(move || {
        let thread = runtime.attach_thread("worker");
        let result = runtime.invoke(&thread, &method, &args);
        let report = WorkerReport {
            result,
            frames_rewritten: thread.stats().frames_rewritten(),
            deoptimizations: thread.stats().deoptimizations(),
        };
        runtime.detach_thread(&thread);
        report
    })
}

fn park_body(f: &Fixture, gate: &Gate) {
    let gate = gate.clone();
    f.interpreter
        .register_method(&f.park, move |cx, _receiver, args| {
            cx.blocking(|| gate.hold());
            let current = cx.current_method().unwrap();
            assert!(current.is_hook_backup(), "frame still runs {}", current.pretty_method());
            Ok(Value::Int(args[0].as_int().unwrap() * 3))
        })
        .unwrap();
}

#[test]
fn test_parked_interpreted_frame_finishes_original() {
    let f = fixture();
    let gate = Gate::new();
    park_body(&f, &gate);

    let worker = spawn_worker(&f, &f.park, vec![Value::Int(5)]);
    gate.parked.wait();
    f.runtime.enable_hook(&f.main, &f.park, ObjectRef::new(())).unwrap();
    gate.release.wait();

    let report = worker.join().unwrap();
    assert_eq!(report.result, Ok(Value::Int(15)));
    assert_eq!(report.frames_rewritten, 1);
    assert_eq!(f.runtime.invoke(&f.main, &f.park, &[Value::Int(5)]), Ok(HOOKED));
    assert_eq!(f.runtime.safepoint_stats().windows(), 1);
}

#[test]
fn test_compiled_frame_deoptimizes_into_backup() {
    let f = fixture();
    let gate = Gate::new();
    f.interpreter
        .register_method(&f.park, |_cx, _receiver, args| Ok(Value::Int(args[0].as_int().unwrap() * 3)))
        .unwrap();
    let held = gate.clone();
    f.runtime
        .install_compiled_code(
            &f.park,
            32,
            quick_code(move |cx, _method, _args| {
                cx.blocking(|| held.hold());
                Ok(QuickOutcome::Deoptimize)
            }),
        )
        .unwrap();

    let worker = spawn_worker(&f, &f.park, vec![Value::Int(4)]);
    gate.parked.wait();
    f.runtime.enable_hook(&f.main, &f.park, ObjectRef::new(())).unwrap();
    let jit = f.runtime.jit().unwrap();
    assert!(!jit.code_cache().contains_method(f.park.addr()));
    gate.release.wait();

    let report = worker.join().unwrap();
    assert_eq!(report.result, Ok(Value::Int(12)));
    assert_eq!(report.deoptimizations, 1);
    assert_eq!(report.frames_rewritten, 1);
}

#[test]
fn test_inlined_entries_rewritten() {
    let f = fixture();
    let gate = Gate::new();
    let park = f.park.clone();
    let held = gate.clone();
    f.runtime
        .install_compiled_code(
            &f.outer,
            64,
            quick_code(move |cx, _method, _args| {
                cx.record_inlined(&park);
                cx.blocking(|| held.hold());
                let inlined = cx.inlined_methods();
                let backup = inlined.len() == 1 && inlined[0].is_hook_backup() && inlined[0] != park;
                Ok(QuickOutcome::Return(Value::Bool(backup)))
            }),
        )
        .unwrap();

    let worker = spawn_worker(&f, &f.outer, Vec::new());
    gate.parked.wait();
    f.runtime.enable_hook(&f.main, &f.park, ObjectRef::new(())).unwrap();
    gate.release.wait();

    let report = worker.join().unwrap();
    assert_eq!(report.result, Ok(Value::Bool(true)));
    assert_eq!(report.frames_rewritten, 1);
    assert!(!f.outer.is_hook_redirected());
}

#[test]
fn test_instrumentation_resynchronised() {
    let f = fixture();
    let gate = Gate::new();
    park_body(&f, &gate);
    f.runtime.instrumentation().enable();

    let worker = spawn_worker(&f, &f.park, vec![Value::Int(2)]);
    gate.parked.wait();
    f.runtime.enable_hook(&f.main, &f.park, ObjectRef::new(())).unwrap();
    gate.release.wait();

    let report = worker.join().unwrap();
    assert_eq!(report.result, Ok(Value::Int(6)));
    let instrumentation = f.runtime.instrumentation();
    assert_eq!(instrumentation.resync_count(), 1);
    assert_eq!(instrumentation.entry_count(), 1);
    assert_eq!(instrumentation.exit_count(), 1);
}

#[test]
fn test_running_thread_stops_at_safepoint() {
    let f = fixture();
    f.interpreter
        .register_method(&f.outer, |_cx, _receiver, _args| Ok(Value::Int(7)))
        .unwrap();
    let started = Arc::new(Barrier::new(2));

    let runtime = Arc::clone(&f.runtime);
    let outer = f.outer.clone();
    let running = Arc::clone(&started);
    let worker = thread::spawn(move || {
        let thread = runtime.attach_thread("spinner");
        let mut calls = 0u64;
        let mut seen_original = false;
        loop {
            let value = runtime.invoke(&thread, &outer, &[]).unwrap();
            calls += 1;
            if calls == 1 {
                running.wait();
            }
            match value {
                Value::Int(7) => seen_original = true,
                v if v == HOOKED => break,
                other => panic!("unexpected result {other:?}"),
            }
        }
        runtime.detach_thread(&thread);
        seen_original
    });

    started.wait();
    f.runtime.enable_hook(&f.main, &f.outer, ObjectRef::new(())).unwrap();
    assert!(worker.join().unwrap());
    assert_eq!(f.runtime.safepoint_stats().windows(), 1);
    assert_eq!(f.runtime.threads().len(), 1);
}

#[test]
fn test_concurrent_installs_redirect_once() {
    let f = fixture();
    let start = Arc::new(Barrier::new(2));

    let runtime = Arc::clone(&f.runtime);
    let park = f.park.clone();
    let ready = Arc::clone(&start);
    let other = thread::spawn(move || {
        let thread = runtime.attach_thread("hooker");
        ready.wait();
        let result = runtime.enable_hook(&thread, &park, ObjectRef::new(()));
        runtime.detach_thread(&thread);
        result
    });

    start.wait();
    f.runtime.enable_hook(&f.main, &f.park, ObjectRef::new(())).unwrap();
    other.join().unwrap().unwrap();

    assert!(f.park.is_hook_redirected());
    let backup = f.park.backup_method().unwrap();
    assert!(backup.is_hook_backup());
    assert!(!backup.is_hook_redirected());
    assert_eq!(f.runtime.invoke(&f.main, &f.park, &[Value::Int(1)]), Ok(HOOKED));
}
