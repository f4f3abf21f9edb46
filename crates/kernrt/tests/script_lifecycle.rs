mod support;

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use kernrt::runtime::has_current_script;
use kernrt::{
    with_current_script, with_published, ForEachParams, HandleElement, LaunchRange, PlainElement,
    RootEntry, Script, ScriptError, ScriptState,
};
use support::{info_text, obj, FakeImage, Harness, RefEvent};

thread_local! {
    static INIT_CALLS: Cell<u32> = const { Cell::new(0) };
    static DTOR_CALLS: Cell<u32> = const { Cell::new(0) };
    static ROOT_SAW_SCRIPT: Cell<bool> = const { Cell::new(false) };
    static ROUTINE_ARGS: RefCell<Option<(bool, Vec<u8>)>> = const { RefCell::new(None) };
    static CALLEE: Cell<*const Script> = const { Cell::new(std::ptr::null()) };
    static CURRENT_SEEN: RefCell<Vec<Option<String>>> = const { RefCell::new(Vec::new()) };
}

fn current_name() -> Option<String> {
    with_current_script(|s| s.identity().res_name.clone())
}

extern "C" fn init() {
    INIT_CALLS.with(|c| c.set(c.get() + 1));
}

extern "C" fn dtor() {
    DTOR_CALLS.with(|c| c.set(c.get() + 1));
}

extern "C" fn root() -> i32 {
    ROOT_SAW_SCRIPT.with(|c| c.set(has_current_script()));
    42
}

extern "C" fn setup(params: *const c_void, len: u32) {
    let bytes = if params.is_null() {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(params as *const u8, len as usize) }.to_vec()
    };
    ROUTINE_ARGS.with(|a| *a.borrow_mut() = Some((params.is_null(), bytes)));
}

extern "C" fn note_current() -> i32 {
    CURRENT_SEEN.with(|c| c.borrow_mut().push(current_name()));
    7
}

/// Calls the callee's root from inside this routine.
extern "C" fn call_across(_params: *const c_void, _len: u32) {
    CURRENT_SEEN.with(|c| c.borrow_mut().push(current_name()));
    let callee = CALLEE.with(Cell::get);
    let ret = unsafe { &*callee }.invoke_root().unwrap();
    assert_eq!(ret, Some(7));
    CURRENT_SEEN.with(|c| c.borrow_mut().push(current_name()));
}

extern "C" fn noop_kernel(_p: *const ForEachParams, _x1: u32, _x2: u32, _i: u32, _o: u32) {}

fn full_image() -> FakeImage {
    FakeImage::new(&info_text(&["gScale"], &["setup"], &[(0, "root")], &[]))
        .code("init", init as usize)
        .code(".rs.dtor", dtor as usize)
        .code("root", root as usize)
        .code("root.expand", noop_kernel as usize)
        .code("setup", setup as usize)
        .global("gScale", 4)
}

#[test]
fn missing_function_is_fatal_and_releases_the_module() {
    let h = Harness::new();
    h.install_app("nofunc", FakeImage::new(&info_text(&[], &["setup"], &[], &[])));

    let err = h.create("nofunc").unwrap_err();
    let ScriptError::Loader { what, diagnostic } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(what.contains("setup"), "{what}");
    assert_eq!(diagnostic, "undefined symbol: setup");
    assert_eq!(h.loader.live(), 0);
    assert_eq!(h.loader.closes(), 1);
}

#[test]
fn missing_kernel_past_slot_zero_is_fatal() {
    let h = Harness::new();
    h.install_app(
        "nokernel",
        FakeImage::new(&info_text(&[], &[], &[(0, "root"), (35, "blur")], &[])),
    );

    let err = h.create("nokernel").unwrap_err();
    assert!(
        matches!(&err, ScriptError::Loader { what, .. } if what.contains("blur.expand")),
        "{err}"
    );
    assert_eq!(h.loader.live(), 0);
}

#[test]
fn missing_default_kernel_fails_only_at_launch() {
    let h = Harness::new();
    h.install_app(
        "nodefault",
        FakeImage::new(&info_text(&[], &[], &[(0, "root"), (35, "blur")], &[]))
            .code("blur.expand", noop_kernel as usize),
    );

    let script = h.create("nodefault").unwrap();
    assert!(script.symbols().foreach()[0].kernel.is_none());
    assert!(script.symbols().foreach()[1].kernel.is_some());

    let alloc = kernrt::HostAllocation::new(kernrt::Dims::new(4, 0, 0), 4);
    let err = script
        .invoke_for_each(0, Some(&alloc), None, None, None)
        .unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");

    // An empty range does not hide the missing kernel.
    let empty = LaunchRange::x(2, 2);
    let err = script
        .invoke_for_each(0, Some(&alloc), None, None, Some(&empty))
        .unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
}

#[test]
fn module_without_self_description_is_rejected() {
    let h = Harness::new();
    h.install_app("bare", FakeImage::without_info().code("root", root as usize));

    let err = h.create("bare").unwrap_err();
    assert!(
        matches!(&err, ScriptError::Configuration(msg) if msg.contains(".rs.info")),
        "{err}"
    );
    assert_eq!(h.loader.live(), 0);
}

#[test]
fn malformed_self_description_releases_the_module() {
    let h = Harness::new();
    h.install_app(
        "broken",
        FakeImage::new("exportVarCount: 2\ngA\nexportFuncCount: x\n"),
    );

    let err = h.create("broken").unwrap_err();
    assert!(
        matches!(&err, ScriptError::Configuration(msg) if msg.contains("malformed export metadata")),
        "{err}"
    );
    assert!(err.is_construction_fatal());
    assert_eq!(h.loader.live(), 0);
}

#[test]
fn entry_points_wait_for_the_initializer() {
    let h = Harness::new();
    h.install_app("lazy", full_image());

    let mut script = h.load("lazy").unwrap();
    assert_eq!(script.state(), ScriptState::Loaded);
    assert_eq!(INIT_CALLS.with(Cell::get), 0);

    assert!(matches!(script.invoke_root(), Err(ScriptError::NotReady(_))));
    assert!(matches!(
        script.invoke_routine(0, &[]),
        Err(ScriptError::NotReady(_))
    ));
    let alloc = kernrt::HostAllocation::new(kernrt::Dims::new(4, 0, 0), 4);
    assert!(matches!(
        script.invoke_for_each(0, Some(&alloc), None, None, None),
        Err(ScriptError::NotReady(_))
    ));

    // Globals can be primed before initialization.
    unsafe { script.write_global(0, &3u32.to_le_bytes()).unwrap() };

    script.invoke_initializer();
    assert_eq!(script.state(), ScriptState::Ready);
    assert_eq!(INIT_CALLS.with(Cell::get), 1);
    assert_eq!(script.invoke_root().unwrap(), Some(42));
}

#[test]
fn create_runs_init_once_and_finalizer_on_request() {
    let h = Harness::new();
    h.install_app("lifecycle", full_image());

    let script = h.create("lifecycle").unwrap();
    assert_eq!(script.state(), ScriptState::Ready);
    assert_eq!(INIT_CALLS.with(Cell::get), 1);
    assert_eq!(DTOR_CALLS.with(Cell::get), 0);

    script.invoke_finalizer();
    assert_eq!(DTOR_CALLS.with(Cell::get), 1);
    drop(script);
    assert_eq!(DTOR_CALLS.with(Cell::get), 1);
}

#[test]
fn routine_receives_its_parameter_block() {
    let h = Harness::new();
    h.install_app("routine", full_image());
    let script = h.create("routine").unwrap();

    script.invoke_routine(0, &[1, 2, 3, 4, 5]).unwrap();
    let seen = ROUTINE_ARGS.with(|a| a.borrow_mut().take());
    assert_eq!(seen, Some((false, vec![1, 2, 3, 4, 5])));

    script.invoke_routine(0, &[]).unwrap();
    let seen = ROUTINE_ARGS.with(|a| a.borrow_mut().take());
    assert_eq!(seen, Some((true, Vec::new())));

    let err = script.invoke_routine(1, &[]).unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
}

#[test]
fn root_runs_with_the_script_published() {
    let h = Harness::new();
    h.install_app("rooted", full_image());
    let script = h.create("rooted").unwrap();

    assert!(!has_current_script());
    assert_eq!(script.invoke_root().unwrap(), Some(42));
    assert!(ROOT_SAW_SCRIPT.with(Cell::get));
    assert!(!has_current_script());
}

#[test]
fn nested_entry_restores_the_calling_script() {
    let h = Harness::new();
    h.install_app(
        "caller",
        FakeImage::new(&info_text(&[], &["callAcross"], &[], &[]))
            .code("callAcross", call_across as usize),
    );
    h.install_app(
        "callee",
        FakeImage::new(&info_text(&[], &[], &[], &[])).code("root", note_current as usize),
    );
    let caller = h.create("caller").unwrap();
    let callee = h.create("callee").unwrap();
    CALLEE.with(|c| c.set(&callee as *const Script));

    caller.invoke_routine(0, &[]).unwrap();
    CALLEE.with(|c| c.set(std::ptr::null()));

    let seen = CURRENT_SEEN.with(|c| std::mem::take(&mut *c.borrow_mut()));
    assert_eq!(
        seen,
        vec![
            Some("caller".to_string()),
            Some("callee".to_string()),
            Some("caller".to_string()),
        ]
    );
    assert!(!has_current_script());
}

#[test]
fn publication_is_scoped_even_when_unwinding() {
    let h = Harness::new();
    let image = || FakeImage::new(&info_text(&[], &[], &[], &[]));
    h.install_app("first", image());
    h.install_app("second", image());
    let first = h.create("first").unwrap();
    let second = h.create("second").unwrap();

    with_published(&first, || {
        assert_eq!(current_name().as_deref(), Some("first"));
        let inner = with_published(&second, current_name);
        assert_eq!(inner.as_deref(), Some("second"));
        assert_eq!(current_name().as_deref(), Some("first"));

        let unwound = catch_unwind(AssertUnwindSafe(|| {
            with_published(&second, || panic!("kernel support failed"))
        }));
        assert!(unwound.is_err());
        assert_eq!(current_name().as_deref(), Some("first"));
    });
    assert!(!has_current_script());

    drop(second);
    drop(first);
    assert!(with_current_script(|_| ()).is_none());
}

#[test]
fn info_reports_counts_and_root_entry() {
    let h = Harness::new();
    h.install_app("full", full_image());
    h.install_app(
        "plain",
        FakeImage::new(&info_text(&[], &[], &[], &[])).code("root", root as usize),
    );
    h.install_app("rootless", FakeImage::new(&info_text(&[], &[], &[], &[])));

    let full = h.create("full").unwrap();
    let info = full.info();
    assert_eq!(info.exported_variable_count, 1);
    assert_eq!(info.exported_function_count, 1);
    assert_eq!(info.exported_foreach_count, 1);
    assert_eq!(info.exported_pragma_count, 0);
    assert_eq!(info.root, RootEntry::Expanded);

    assert_eq!(h.create("plain").unwrap().info().root, RootEntry::Plain);
    let rootless = h.create("rootless").unwrap();
    assert_eq!(rootless.info().root, RootEntry::Absent);
    assert_eq!(rootless.invoke_root().unwrap(), None);
}

fn object_image() -> FakeImage {
    FakeImage::new(&info_text(&["gA", "gB", "gC", "gMissing"], &[], &[], &[0, 1, 2, 3]))
        .global("gA", 8)
        .global("gB", 8)
        .global("gC", 8)
}

#[test]
fn destroy_releases_each_populated_object_slot_once() {
    let h = Harness::new();
    h.install_app("objects", object_image());
    h.objects.hold(0x1000, 1);
    h.objects.hold(0x2000, 1);

    let mut script = h.create("objects").unwrap();
    script.write_global_object(0, obj(0x1000)).unwrap();
    script.write_global_object(1, obj(0x2000)).unwrap();
    // Slot 3 has no address; the store is dropped silently.
    script.write_global_object(3, obj(0x2000)).unwrap();
    assert_eq!(h.objects.count(0x1000), 2);
    assert_eq!(h.objects.count(0x2000), 2);

    h.objects.clear_events();
    drop(script);
    let mut events = h.objects.events();
    events.sort_by_key(|e| match e {
        RefEvent::Inc(o) | RefEvent::Dec(o) => *o,
    });
    assert_eq!(events, vec![RefEvent::Dec(0x1000), RefEvent::Dec(0x2000)]);
    assert_eq!(h.objects.count(0x1000), 1);
    assert_eq!(h.objects.count(0x2000), 1);
    assert_eq!(h.loader.live(), 0);
}

#[test]
fn reassigning_an_object_to_itself_keeps_it_alive() {
    let h = Harness::new();
    h.install_app("selfassign", object_image());
    h.objects.hold(0x3000, 1);

    let mut script = h.create("selfassign").unwrap();
    script.write_global_object(0, obj(0x3000)).unwrap();
    script.write_global_object(0, obj(0x3000)).unwrap();
    assert_eq!(h.objects.count(0x3000), 2);
    assert!(h.objects.min_seen(0x3000) >= 1);

    script.write_global_object(0, None).unwrap();
    assert_eq!(h.objects.count(0x3000), 1);
}

#[test]
fn raw_and_object_writes_respect_slot_kinds() {
    let h = Harness::new();
    h.install_app(
        "kinds",
        FakeImage::new(&info_text(&["gObj", "gPlain"], &[], &[], &[0]))
            .global("gObj", 8)
            .global("gPlain", 4),
    );
    let mut script = h.create("kinds").unwrap();

    let err = unsafe { script.write_global(0, &[0u8; 8]) }.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
    let err = script.write_global_object(1, obj(0x10)).unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
    let err = unsafe { script.write_global(9, &[0u8; 4]) }.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
}

#[test]
fn array_store_takes_new_references_before_dropping_old_ones() {
    let h = Harness::new();
    h.install_app(
        "array",
        FakeImage::new(&info_text(&["gHandles", "gFloats"], &[], &[], &[]))
            .global("gHandles", 16)
            .global("gFloats", 12),
    );
    for o in [0x100usize, 0x200, 0x300] {
        h.objects.hold(o, 1);
    }
    let mut script = h.create("array").unwrap();
    let element = HandleElement {
        runtime: &*h.objects,
    };
    let handles = |a: usize, b: usize| [a.to_ne_bytes(), b.to_ne_bytes()].concat();

    unsafe { script.write_global_array(0, &handles(0x100, 0x200), &element, &[2]) }.unwrap();
    h.objects.clear_events();
    unsafe { script.write_global_array(0, &handles(0x200, 0x300), &element, &[2]) }.unwrap();
    assert_eq!(
        h.objects.events(),
        vec![
            RefEvent::Inc(0x200),
            RefEvent::Inc(0x300),
            RefEvent::Dec(0x100),
            RefEvent::Dec(0x200),
        ]
    );
    assert!(h.objects.min_seen(0x200) >= 1);
    assert_eq!(h.objects.count(0x100), 1);
    assert_eq!(h.objects.count(0x200), 2);

    let mut out = [0u8; 16];
    unsafe { script.read_global(0, &mut out).unwrap() };
    assert_eq!(out.to_vec(), handles(0x200, 0x300));

    let floats: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|f| f.to_le_bytes()).collect();
    let plain = PlainElement { size: 4 };
    unsafe { script.write_global_array(1, &floats, &plain, &[3]) }.unwrap();
    let err = unsafe { script.write_global_array(1, &floats, &plain, &[3, 1]) }.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
    let err = unsafe { script.write_global_array(1, &floats, &plain, &[2]) }.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "{err}");
}
