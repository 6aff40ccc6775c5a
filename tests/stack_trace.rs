mod common;

use common::{frames, initialized, method_id, FakeJvmti};
use jvmti_correlation::stack::{
    self, decode_frames, FrameEncoding, FrameSink, Location, MethodHandle, StackRequest,
    MAX_ALLOCATION_FREE_FRAMES, METHOD_NAME_STACK_BUFFER,
};
use jvmti_correlation::config::AgentConfig;
use jvmti_correlation::sys::jni::jclass;
use jvmti_correlation::sys::jvmti::{jvmtiError, jvmtiFrameInfo};
use jvmti_correlation::AgentError;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

// Counts heap allocations made by the current thread so tests running in
// parallel do not see each other's.
struct CountingAllocator;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

fn allocations_during<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = ALLOCATIONS.with(Cell::get);
    let result = f();
    (result, ALLOCATIONS.with(Cell::get) - before)
}

fn fake_with_frames(n: usize) -> FakeJvmti {
    let jvmti = FakeJvmti::default();
    jvmti.state().frames = frames(n);
    jvmti
}

#[test]
fn small_captures_do_not_allocate() {
    let (agent, runtime) = initialized();
    runtime.jvmti.state().frames = frames(64);
    let mut words = vec![0i64; 2 * MAX_ALLOCATION_FREE_FRAMES];
    let request = StackRequest::current_thread(0, MAX_ALLOCATION_FREE_FRAMES as i32, FrameEncoding::WithLocations);

    let (count, allocations) = allocations_during(|| agent.capture_stack_trace(&request, &mut words));

    assert_eq!(count, Ok(MAX_ALLOCATION_FREE_FRAMES));
    assert_eq!(allocations, 0);
}

#[test]
fn large_captures_use_a_heap_scratch_buffer() {
    let jvmti = fake_with_frames(100);
    let mut words = vec![0i64; 100];
    let request = StackRequest::current_thread(0, 100, FrameEncoding::MethodsOnly);

    let (count, allocations) = allocations_during(|| stack::capture_stack_trace(&jvmti, &request, &mut words));

    assert_eq!(count, Ok(100));
    assert!(allocations > 0);
}

#[test]
fn both_paths_produce_the_same_frames() {
    let jvmti = fake_with_frames(20);
    let mut small = vec![0i64; 2 * 30];
    let mut large = vec![0i64; 2 * 200];

    let n_small = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 30, FrameEncoding::WithLocations),
        &mut small,
    )
    .unwrap();
    let n_large = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 200, FrameEncoding::WithLocations),
        &mut large,
    )
    .unwrap();

    assert_eq!(n_small, 20);
    assert_eq!(n_large, 20);
    assert_eq!(small[..40], large[..40]);
}

#[test]
fn frames_decode_back_to_methods_and_locations() {
    let jvmti = FakeJvmti::default();
    let mut source = frames(3);
    source[2].location = -1;
    jvmti.state().frames = source;
    let mut words = vec![0i64; 8];

    let count = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 4, FrameEncoding::WithLocations),
        &mut words,
    )
    .unwrap();

    let decoded: Vec<_> = decode_frames(&words, count, FrameEncoding::WithLocations).collect();
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0], (MethodHandle::from_method_id(method_id(0)), Location::from_raw(0)));
    assert_eq!(decoded[1].1, Location::from_raw(10));
    assert_eq!(decoded[1].0.method_id(), method_id(1));
    assert!(decoded[2].1.unwrap().is_native());
    // The slot past the last frame is untouched.
    assert_eq!(words[6..], [0, 0]);
}

#[test]
fn methods_only_writes_one_word_per_frame() {
    let jvmti = fake_with_frames(5);
    let mut words = vec![-7i64; 5];

    let count = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(2, 5, FrameEncoding::MethodsOnly),
        &mut words,
    )
    .unwrap();

    assert_eq!(count, 3);
    assert_eq!(jvmti.state().last_stack_request, Some((2, 5)));
    let methods: Vec<_> = decode_frames(&words, count, FrameEncoding::MethodsOnly)
        .map(|(method, location)| {
            assert!(location.is_none());
            method.method_id()
        })
        .collect();
    assert_eq!(methods, vec![method_id(2), method_id(3), method_id(4)]);
    assert_eq!(words[3..], [-7, -7]);
}

#[test]
fn adding_locations_keeps_the_same_methods_in_order() {
    let jvmti = fake_with_frames(6);
    let mut methods = vec![0i64; 6];
    let mut pairs = vec![0i64; 12];

    let n = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 6, FrameEncoding::MethodsOnly),
        &mut methods,
    )
    .unwrap();
    let m = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 6, FrameEncoding::WithLocations),
        &mut pairs,
    )
    .unwrap();

    assert_eq!(n, m);
    for (i, frame) in pairs.chunks_exact(2).enumerate() {
        assert_eq!(frame[0], methods[i]);
        assert_eq!(frame[1], 10 * i as i64);
    }
}

#[test]
fn invalid_requests_never_reach_jvmti() {
    let jvmti = fake_with_frames(4);
    let mut words = vec![0i64; 8];

    for request in [
        StackRequest::current_thread(-1, 4, FrameEncoding::MethodsOnly),
        StackRequest::current_thread(0, 0, FrameEncoding::MethodsOnly),
        StackRequest::current_thread(0, -3, FrameEncoding::MethodsOnly),
        StackRequest::current_thread(0, 5, FrameEncoding::WithLocations),
    ] {
        let err = stack::capture_stack_trace(&jvmti, &request, &mut words).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)), "{request:?}: {err}");
    }
    assert_eq!(jvmti.state().stack_trace_calls, 0);
}

#[test]
fn capture_failure_reports_the_jvmti_code() {
    let jvmti = fake_with_frames(4);
    jvmti.fail("GetStackTrace", jvmtiError::THREAD_NOT_ALIVE);
    let mut words = vec![9i64; 4];

    let err = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 4, FrameEncoding::MethodsOnly),
        &mut words,
    )
    .unwrap_err();

    assert_eq!(err, AgentError::Jvmti { operation: "GetStackTrace", code: 15 });
    assert_eq!(words, vec![9; 4]);
}

/// A sink whose backing memory cannot be pinned.
struct UnpinnableSink {
    len: usize,
}

impl FrameSink for UnpinnableSink {
    fn capacity(&self) -> usize {
        self.len
    }

    fn pin<R>(&mut self, _write: impl FnOnce(&mut [i64]) -> R) -> Option<R> {
        None
    }
}

#[test]
fn inaccessible_output_is_a_buffer_access_error() {
    let jvmti = fake_with_frames(4);
    let mut sink = UnpinnableSink { len: 8 };

    let err = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 4, FrameEncoding::WithLocations),
        &mut sink,
    )
    .unwrap_err();

    assert!(matches!(err, AgentError::BufferAccess(_)));
    assert_eq!(jvmti.state().stack_trace_calls, 1);
}

#[test]
fn slices_are_frame_sinks() {
    let jvmti = fake_with_frames(2);
    let mut words = [0i64; 4];

    let count = stack::capture_stack_trace(
        &jvmti,
        &StackRequest::current_thread(0, 2, FrameEncoding::WithLocations),
        &mut words[..],
    )
    .unwrap();

    assert_eq!(count, 2);
    assert_eq!(words[1], 0);
    assert_eq!(words[3], 10);
}

fn fake_with_method(name: &str, signature: &str) -> FakeJvmti {
    let jvmti = FakeJvmti::default();
    {
        let mut state = jvmti.state();
        state.method_names.insert(method_id(1) as usize, (name.to_string(), signature.to_string()));
        state.declaring_classes.insert(method_id(1) as usize, 0xc1a55);
    }
    jvmti
}

fn handle(n: usize) -> MethodHandle {
    MethodHandle::from_method_id(method_id(n))
}

#[test]
fn method_name_with_and_without_signature() {
    let jvmti = fake_with_method("run", "()V");

    let plain = stack::with_method_name(&jvmti, handle(1), false, |name| name.to_str().unwrap().to_string());
    let full = stack::with_method_name(&jvmti, handle(1), true, |name| name.to_str().unwrap().to_string());

    assert_eq!(plain.as_deref(), Some("run"));
    assert_eq!(full.as_deref(), Some("run()V"));
}

#[test]
fn long_method_names_are_not_truncated() {
    let name = "m".repeat(METHOD_NAME_STACK_BUFFER);
    let signature = "(Ljava/lang/String;)V";
    let jvmti = fake_with_method(&name, signature);

    let full = stack::with_method_name(&jvmti, handle(1), true, |n| n.to_bytes().len()).unwrap();
    let text = stack::with_method_name(&jvmti, handle(1), true, |n| n.to_str().unwrap().to_string()).unwrap();

    assert_eq!(full, name.len() + signature.len());
    assert!(text.starts_with("mmm"));
    assert!(text.ends_with(signature));
}

#[test]
fn unresolvable_methods_yield_none() {
    let jvmti = fake_with_method("run", "()V");

    assert!(stack::with_method_name(&jvmti, handle(7), true, |_| ()).is_none());
    assert!(stack::declaring_class(&jvmti, handle(7)).is_none());

    jvmti.fail("GetMethodName", jvmtiError::WRONG_PHASE);
    assert!(stack::with_method_name(&jvmti, handle(1), false, |_| ()).is_none());
}

#[test]
fn declaring_class_through_the_agent() {
    let (agent, runtime) = initialized();
    runtime.jvmti.state().declaring_classes.insert(method_id(4) as usize, 0xbeef);

    assert_eq!(agent.declaring_class(handle(4).raw()).unwrap(), Some(0xbeef as jclass));
    assert_eq!(agent.declaring_class(handle(5).raw()).unwrap(), None);
}

#[test]
fn words_that_are_not_methods_resolve_to_nothing() {
    let (agent, runtime) = initialized();
    runtime.jvmti.state().method_names.insert(method_id(2) as usize, ("run".to_string(), "()V".to_string()));

    let name = agent.with_method_name(handle(2).raw(), true, |n| n.to_str().unwrap().to_string());
    assert_eq!(name.unwrap().as_deref(), Some("run()V"));
    assert_eq!(agent.declaring_class(0).unwrap(), None);
    assert_eq!(agent.with_method_name(0, true, |_| ()).unwrap(), None);

    let fresh = common::agent(AgentConfig::default());
    assert_eq!(fresh.declaring_class(0), Err(AgentError::NotInitialized));
    assert_eq!(fresh.with_method_name(0, false, |_| ()), Err(AgentError::NotInitialized));
}

#[test]
fn handles_and_locations_reject_impossible_values() {
    assert!(MethodHandle::from_raw(0).is_none());
    assert_eq!(MethodHandle::from_raw(0x1234).map(MethodHandle::raw), Some(0x1234));
    assert!(Location::from_raw(-2).is_none());
    assert_eq!(Location::from_raw(-1), Some(Location::NATIVE));
    assert!(!Location::from_raw(0).unwrap().is_native());
    assert_eq!(FrameEncoding::from_flag(true).words_per_frame(), 2);
    assert_eq!(jvmtiFrameInfo::default().location, 0);
}
