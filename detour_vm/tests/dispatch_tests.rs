use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use detour_core::{CodeAddress, Value, VmError, stubs};
use detour_runtime::{AccessFlags, ClassDef, ClassLoaderId, CodeItem, DexFile, MethodDef, MethodRecord, MethodRef};
use detour_vm::{
    DebuggerPolicy, ManagedThread, QuickCode, QuickOutcome, Runtime, RuntimeConfig, TableInterpreter, quick_code,
};

const CALC: &str = "Lcom/example/Calc;";
const SHAPE: &str = "Lcom/example/Shape;";

struct Fixture {
    runtime: Runtime,
    interpreter: Arc<TableInterpreter>,
    compute: MethodRef,
    twice: MethodRef,
    area: MethodRef,
    thread: Arc<ManagedThread>,
}

// Calc { static int compute(); int twice(int) }, abstract Shape { abstract int area() }
fn fixture_with(runtime: Runtime, interpreter: Arc<TableInterpreter>) -> Fixture {
    let mut b = DexFile::builder("calc.dex");
    let compute_idx = b.add_method(CALC, "compute", "I", &[]);
    let twice_idx = b.add_method(CALC, "twice", "I", &["I"]);
    let area_idx = b.add_method(SHAPE, "area", "I", &[]);
    let compute_code = b.add_code_item(CodeItem::new(1, 0, vec![0x000f]));
    let twice_code = b.add_code_item(CodeItem::new(2, 2, vec![0x000f]));
    let dex = b.build();

    let calc = runtime
        .linker()
        .define_class(
            ClassDef::new(ClassLoaderId::BOOT, Arc::clone(&dex), CALC)
                .with_method(MethodDef::new(compute_idx, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(compute_code))
                .with_method(MethodDef::new(twice_idx, AccessFlags::PUBLIC).with_code(twice_code)),
        )
        .unwrap();
    let shape = runtime
        .linker()
        .define_class(
            ClassDef::new(ClassLoaderId::BOOT, dex, SHAPE)
                .with_access_flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)
                .with_method(MethodDef::new(area_idx, AccessFlags::PUBLIC | AccessFlags::ABSTRACT)),
        )
        .unwrap();

    let compute = calc.direct_methods()[0].clone();
    let twice = calc.virtual_methods()[0].clone();
    let area = shape.virtual_methods()[0].clone();
    interpreter
        .register_method(&compute, |_cx, _receiver, _args| Ok(Value::Int(7)))
        .unwrap();
    interpreter
        .register_method(&twice, |_cx, _receiver, args| Ok(Value::Int(args[0].as_int().unwrap() * 2)))
        .unwrap();

    let thread = runtime.attach_thread("main");
    Fixture {
        runtime,
        interpreter,
        compute,
        twice,
        area,
        thread,
    }
}

fn fixture(config: RuntimeConfig) -> Fixture {
    let interpreter = Arc::new(TableInterpreter::new());
    let runtime = Runtime::builder(config).with_interpreter(interpreter.clone()).build();
    let f = fixture_with(runtime, interpreter);
    f.runtime.start();
    f
}

fn counting_code(calls: &Arc<AtomicUsize>, result: i64) -> Arc<dyn QuickCode> {
    let calls = Arc::clone(calls);
    quick_code(move |_cx, _method, _args| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(QuickOutcome::Return(Value::Int(result)))
    })
}

#[test]
fn test_interpreted_call() {
    let f = fixture(RuntimeConfig::for_testing());
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(f.thread.stats().fragments_pushed(), 1);
    assert_eq!(f.thread.fragment_depth(), 0);
    assert_eq!(f.thread.stack_depth(), 0);
}

#[test]
fn test_compiled_code_runs_when_started() {
    let f = fixture(RuntimeConfig::for_testing());
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(70)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_not_started_forces_interpreter() {
    let interpreter = Arc::new(TableInterpreter::new());
    let runtime = Runtime::builder(RuntimeConfig::for_testing())
        .with_interpreter(interpreter.clone())
        .build();
    let f = fixture_with(runtime, interpreter);
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();

    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    f.runtime.start();
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(70)));
}

#[test]
fn test_interpret_only_ignores_compiled_code() {
    let f = fixture(RuntimeConfig {
        interpret_only: true,
        ..RuntimeConfig::for_testing()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

struct InterpretNamed(&'static str);

impl DebuggerPolicy for InterpretNamed {
    fn is_forced_interpreter_needed_for_calling(&self, _thread: &ManagedThread, method: &MethodRecord) -> bool {
        method.name().as_deref() == Some(self.0)
    }
}

#[test]
fn test_debugger_forces_interpreter() {
    let interpreter = Arc::new(TableInterpreter::new());
    let runtime = Runtime::builder(RuntimeConfig::for_testing())
        .with_interpreter(interpreter.clone())
        .with_debugger(Arc::new(InterpretNamed("compute")))
        .build();
    runtime.start();
    let f = fixture_with(runtime, interpreter);
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();
    f.runtime
        .install_compiled_code(&f.twice, 32, counting_code(&calls, 99))
        .unwrap();

    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        f.runtime.invoke(&f.thread, &f.twice, &[Value::Int(1), Value::Int(4)]),
        Ok(Value::Int(99))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_null_code_returns_zero() {
    let f = fixture(RuntimeConfig::for_testing());
    assert!(f.area.entry_point_from_quick_compiled_code().is_null());
    assert_eq!(f.runtime.invoke(&f.thread, &f.area, &[Value::Int(1)]), Ok(Value::zero()));
    assert_eq!(f.thread.fragment_depth(), 0);
}

#[test]
fn test_abstract_call_interpreted_raises() {
    let f = fixture(RuntimeConfig {
        interpret_only: true,
        ..RuntimeConfig::for_testing()
    });
    let err = f.runtime.invoke(&f.thread, &f.area, &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.exception_descriptor(), "Ljava/lang/AbstractMethodError;");
}

#[test]
fn test_missing_receiver_rejected() {
    let f = fixture(RuntimeConfig::for_testing());
    let err = f.runtime.invoke(&f.thread, &f.twice, &[]).unwrap_err();
    assert!(matches!(err, VmError::IllegalArgument(_)));
    assert_eq!(f.thread.fragment_depth(), 0);
}

#[test]
fn test_stack_overflow_before_any_side_effect() {
    let f = fixture(RuntimeConfig::for_testing().with_stack_frame_limit(0));
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();

    let err = f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap_err();
    assert_eq!(err, VmError::StackOverflow { depth: 0, limit: 0 });
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.thread.stats().fragments_pushed(), 0);
    assert_eq!(f.thread.fragment_depth(), 0);
}

#[test]
fn test_recursion_hits_stack_limit() {
    let f = fixture(RuntimeConfig::for_testing().with_stack_frame_limit(3));
    let compute = f.compute.clone();
    f.interpreter
        .register_method(&f.compute, move |cx, _receiver, _args| cx.invoke(&compute, &[]))
        .unwrap();

    let err = f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap_err();
    assert_eq!(err, VmError::StackOverflow { depth: 3, limit: 3 });
    assert_eq!(f.thread.stats().fragments_pushed(), 3);
    assert_eq!(f.thread.fragment_depth(), 0);
    assert_eq!(f.thread.stack_depth(), 0);
}

#[test]
fn test_deoptimization_falls_back_to_interpreter() {
    let f = fixture(RuntimeConfig::for_testing());
    f.runtime
        .install_compiled_code(&f.twice, 32, quick_code(|_cx, _method, _args| Ok(QuickOutcome::Deoptimize)))
        .unwrap();
    assert_eq!(
        f.runtime.invoke(&f.thread, &f.twice, &[Value::Int(0), Value::Int(21)]),
        Ok(Value::Int(42))
    );
    assert_eq!(f.thread.stats().deoptimizations(), 1);
    assert_eq!(f.thread.fragment_depth(), 0);
}

#[test]
fn test_instrumentation_shadows_compiled_calls() {
    let f = fixture(RuntimeConfig::for_testing());
    f.runtime.instrumentation().enable();
    assert_eq!(
        f.runtime.invoke(&f.thread, &f.twice, &[Value::Int(0), Value::Int(2)]),
        Ok(Value::Int(4))
    );
    assert_eq!(f.runtime.instrumentation().entry_count(), 1);
    assert_eq!(f.runtime.instrumentation().exit_count(), 1);
    f.runtime.instrumentation().disable();
    f.runtime.invoke(&f.thread, &f.twice, &[Value::Int(0), Value::Int(2)]).unwrap();
    assert_eq!(f.runtime.instrumentation().entry_count(), 1);
}

#[test]
fn test_resolution_stub_installs_bridge() {
    let f = fixture(RuntimeConfig::for_testing());
    f.compute
        .set_entry_point_from_quick_compiled_code(stubs::QUICK_RESOLUTION_STUB);
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(
        f.compute.entry_point_from_quick_compiled_code(),
        stubs::QUICK_TO_INTERPRETER_BRIDGE
    );
}

#[test]
fn test_resolution_stub_prefers_aot_code() {
    let f = fixture(RuntimeConfig::for_testing());
    let calls = Arc::new(AtomicUsize::new(0));
    let aot = CodeAddress(0x4000_0000);
    f.runtime
        .install_aot_code(&f.compute, aot, 48, counting_code(&calls, 11))
        .unwrap();
    f.compute
        .set_entry_point_from_quick_compiled_code(stubs::QUICK_RESOLUTION_STUB);
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(11)));
    assert_eq!(f.compute.entry_point_from_quick_compiled_code(), aot);
}

#[test]
fn test_interpreter_profiles_warm_methods() {
    let f = fixture(RuntimeConfig::for_testing());
    for _ in 0..3 {
        f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap();
    }
    assert_eq!(f.compute.hotness_count(), 3);
    assert!(f.compute.profiling_info().is_none());
    f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap();
    f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap();
    assert_eq!(f.compute.profiling_info().unwrap().sample_count(), 2);
}

#[test]
fn test_hot_interpreted_method_switches_to_compiled_code() {
    let f = fixture(RuntimeConfig::for_testing());
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();
    f.compute
        .set_entry_point_from_quick_compiled_code(stubs::QUICK_TO_INTERPRETER_BRIDGE);

    let results: Vec<_> = (0..9)
        .map(|_| f.runtime.invoke(&f.thread, &f.compute, &[]).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(&results[..7], &[7; 7]);
    assert_eq!(&results[7..], &[70, 70]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unregistered_native_is_unsatisfied() {
    let runtime = Runtime::new(RuntimeConfig::for_testing());
    let mut b = DexFile::builder("native.dex");
    let idx = b.add_method(CALC, "sum", "I", &["I", "I"]);
    let class = runtime
        .linker()
        .define_class(
            ClassDef::new(ClassLoaderId(1), b.build(), CALC)
                .with_method(MethodDef::new(idx, AccessFlags::STATIC | AccessFlags::NATIVE)),
        )
        .unwrap();
    runtime.start();
    let thread = runtime.attach_thread("main");
    let sum = class.direct_methods()[0].clone();

    let err = runtime.invoke(&thread, &sum, &[Value::Int(1), Value::Int(2)]).unwrap_err();
    assert!(matches!(err, VmError::UnsatisfiedLink(_)));

    let address = CodeAddress(0x5000_0000);
    runtime
        .register_native_code(
            address,
            quick_code(|_cx, _method, args| {
                Ok(QuickOutcome::Return(Value::Int(args[0].as_int().unwrap() + args[1].as_int().unwrap())))
            }),
        )
        .unwrap();
    sum.register_native(address, false).unwrap();
    assert_eq!(runtime.invoke(&thread, &sum, &[Value::Int(1), Value::Int(2)]), Ok(Value::Int(3)));
    let reserved = quick_code(|_cx, _m, _a| Ok(QuickOutcome::Deoptimize));
    assert!(runtime.register_native_code(stubs::QUICK_HOOK_TRAMPOLINE, reserved).is_err());
}

#[test]
fn test_method_header_for_pc() {
    let f = fixture(RuntimeConfig::for_testing());
    let code = f
        .runtime
        .install_compiled_code(&f.compute, 64, quick_code(|_cx, _m, _a| Ok(QuickOutcome::Return(Value::Null))))
        .unwrap();

    let header = f
        .runtime
        .method_header_for_pc(&f.compute, code.offset(8))
        .unwrap()
        .unwrap();
    assert_eq!(header.method, f.compute.addr());
    assert_eq!(header.code_start, code);
    assert_eq!(f.runtime.method_header_for_pc(&f.compute, CodeAddress(0x10)).unwrap(), None);
    assert!(matches!(
        f.runtime.method_header_for_pc(&f.compute, CodeAddress::NULL),
        Err(VmError::IllegalArgument(_))
    ));
    assert_eq!(f.runtime.method_header_for_pc(&f.area, CodeAddress(0x10)).unwrap(), None);
}

#[test]
fn test_method_header_for_aot_pc() {
    let f = fixture(RuntimeConfig::for_testing());
    let aot = CodeAddress(0x4000_0000);
    f.runtime
        .install_aot_code(&f.twice, aot, 48, quick_code(|_cx, _m, _a| Ok(QuickOutcome::Return(Value::Null))))
        .unwrap();
    let header = f.runtime.method_header_for_pc(&f.twice, aot.offset(47)).unwrap().unwrap();
    assert_eq!(header.code_size, 48);
    assert_eq!(f.runtime.method_header_for_pc(&f.twice, aot.offset(48)).unwrap(), None);
    let reserved = quick_code(|_cx, _m, _a| Ok(QuickOutcome::Deoptimize));
    assert!(f
        .runtime
        .install_aot_code(&f.twice, stubs::QUICK_TO_INTERPRETER_BRIDGE, 8, reserved)
        .is_err());
}

#[test]
#[should_panic(expected = "does not belong to")]
fn test_foreign_jit_pc_is_fatal() {
    let f = fixture(RuntimeConfig::for_testing());
    let foreign = f
        .runtime
        .install_compiled_code(&f.twice, 64, quick_code(|_cx, _m, _a| Ok(QuickOutcome::Return(Value::Null))))
        .unwrap();
    let _ = f.runtime.method_header_for_pc(&f.compute, foreign.offset(4));
}

#[test]
fn test_invalidate_compiled_code() {
    let f = fixture(RuntimeConfig::for_testing());
    let calls = Arc::new(AtomicUsize::new(0));
    f.runtime
        .install_compiled_code(&f.compute, 32, counting_code(&calls, 70))
        .unwrap();
    assert!(f.runtime.has_any_compiled_code(&f.compute));

    f.runtime.invalidate_compiled_code(&f.compute).unwrap();
    assert!(!f.runtime.has_any_compiled_code(&f.compute));
    assert!(f.compute.ignore_aot_code());
    assert_eq!(
        f.compute.entry_point_from_quick_compiled_code(),
        stubs::QUICK_TO_INTERPRETER_BRIDGE
    );
    assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalidate_hooked_method_rejected() {
    let f = fixture(RuntimeConfig::for_testing());
    f.runtime
        .enable_hook(&f.thread, &f.compute, detour_core::ObjectRef::new(()))
        .unwrap();
    let err = f.runtime.invalidate_compiled_code(&f.compute).unwrap_err();
    assert!(matches!(err, VmError::IllegalArgument(_)));
}

#[test]
fn test_without_jit() {
    let f = fixture(RuntimeConfig::for_testing().with_jit(None));
    assert!(f.runtime.jit().is_none());
    let err = f
        .runtime
        .install_compiled_code(&f.compute, 32, quick_code(|_cx, _m, _a| Ok(QuickOutcome::Deoptimize)))
        .unwrap_err();
    assert!(matches!(err, VmError::IllegalState(_)));
    for _ in 0..10 {
        assert_eq!(f.runtime.invoke(&f.thread, &f.compute, &[]), Ok(Value::Int(7)));
    }
    assert!(f.compute.profiling_info().is_none());
}
