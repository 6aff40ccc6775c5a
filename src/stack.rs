//! Stack trace capture and method metadata resolution.
//!
//! Captured frames are written into a caller-owned region of 64-bit words.
//! Without locations each frame is one word (the method handle); with
//! locations it is two (`[handle, location]`), so frame `i` lives at
//! `words[i]` or `words[2 * i..2 * i + 2]`.

use crate::error::{AgentError, Result};
use crate::introspection::Introspection;
use crate::sys::jni::{jclass, jint, jmethodID, jthread};
use crate::sys::jvmti::{jlocation, jvmtiFrameInfo};
use log::debug;
use std::ffi::CStr;

/// Requests up to this many frames are captured without touching the heap.
pub const MAX_ALLOCATION_FREE_FRAMES: usize = 32;

/// Name+signature concatenations up to this length are built on the stack.
pub const METHOD_NAME_STACK_BUFFER: usize = 1024;

/// Opaque method identifier as it travels through frame buffers.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(i64);

impl MethodHandle {
    pub fn from_method_id(method: jmethodID) -> Self {
        MethodHandle(method as usize as u64 as i64)
    }

    /// Accepts a word read back from a frame buffer. Zero and values that do
    /// not fit a pointer on this platform are rejected.
    pub fn from_raw(raw: i64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        usize::try_from(raw as u64).ok().map(|_| MethodHandle(raw))
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn method_id(self) -> jmethodID {
        self.0 as u64 as usize as jmethodID
    }
}

/// Bytecode index of a frame, or [`Location::NATIVE`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location(i64);

impl Location {
    /// JVMTI reports `-1` for frames executing native code.
    pub const NATIVE: Location = Location(-1);

    pub fn from_jlocation(location: jlocation) -> Self {
        Location(location)
    }

    /// Bytecode locations are non-negative; `-1` is the native marker.
    pub fn from_raw(raw: i64) -> Option<Self> {
        (raw >= -1).then_some(Location(raw))
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    MethodsOnly,
    WithLocations,
}

impl FrameEncoding {
    pub fn from_flag(with_locations: bool) -> Self {
        if with_locations {
            FrameEncoding::WithLocations
        } else {
            FrameEncoding::MethodsOnly
        }
    }

    pub fn words_per_frame(self) -> usize {
        match self {
            FrameEncoding::MethodsOnly => 1,
            FrameEncoding::WithLocations => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackRequest {
    /// Thread to walk; null walks the calling thread.
    pub thread: jthread,
    pub skip: jint,
    pub max_frames: jint,
    pub encoding: FrameEncoding,
}

impl StackRequest {
    pub fn current_thread(skip: jint, max_frames: jint, encoding: FrameEncoding) -> Self {
        StackRequest { thread: std::ptr::null_mut(), skip, max_frames, encoding }
    }

    fn validate(&self, capacity: usize) -> Result<usize> {
        if self.skip < 0 {
            return Err(AgentError::InvalidArgument(format!("skip must be >= 0, got {}", self.skip)));
        }
        if self.max_frames <= 0 {
            return Err(AgentError::InvalidArgument(format!(
                "max_frames must be > 0, got {}",
                self.max_frames
            )));
        }
        let max = self.max_frames as usize;
        let needed = max * self.encoding.words_per_frame();
        if capacity < needed {
            return Err(AgentError::InvalidArgument(format!(
                "frame buffer holds {capacity} words, {needed} needed"
            )));
        }
        Ok(max)
    }
}

/// A caller-owned output region that may need pinning while it is written.
pub trait FrameSink {
    /// Length in words.
    fn capacity(&self) -> usize;

    /// Runs `write` over the pinned region. `None` if it cannot be accessed.
    fn pin<R>(&mut self, write: impl FnOnce(&mut [i64]) -> R) -> Option<R>;
}

impl FrameSink for [i64] {
    fn capacity(&self) -> usize {
        self.len()
    }

    fn pin<R>(&mut self, write: impl FnOnce(&mut [i64]) -> R) -> Option<R> {
        Some(write(self))
    }
}

impl FrameSink for Vec<i64> {
    fn capacity(&self) -> usize {
        self.len()
    }

    fn pin<R>(&mut self, write: impl FnOnce(&mut [i64]) -> R) -> Option<R> {
        Some(write(self.as_mut_slice()))
    }
}

/// Captures frames for `request` into `out` and returns how many were written.
///
/// `out` is left untouched unless the raw capture succeeded.
pub fn capture_stack_trace<I, S>(jvmti: &I, request: &StackRequest, out: &mut S) -> Result<usize>
where
    I: Introspection + ?Sized,
    S: FrameSink + ?Sized,
{
    let max = request.validate(out.capacity())?;
    if max <= MAX_ALLOCATION_FREE_FRAMES {
        let mut frames = [jvmtiFrameInfo::default(); MAX_ALLOCATION_FREE_FRAMES];
        transcode(jvmti, request, &mut frames[..max], out)
    } else {
        let mut frames = vec![jvmtiFrameInfo::default(); max];
        transcode(jvmti, request, &mut frames, out)
    }
}

fn transcode<I, S>(jvmti: &I, request: &StackRequest, frames: &mut [jvmtiFrameInfo], out: &mut S) -> Result<usize>
where
    I: Introspection + ?Sized,
    S: FrameSink + ?Sized,
{
    let count = jvmti
        .stack_trace(request.thread, request.skip, frames)
        .map_err(|e| AgentError::jvmti("GetStackTrace", e))?;
    let frames = &frames[..count.min(frames.len())];
    out.pin(|words| encode(frames, request.encoding, words))
        .ok_or(AgentError::BufferAccess("the frame output buffer"))?;
    Ok(frames.len())
}

fn encode(frames: &[jvmtiFrameInfo], encoding: FrameEncoding, words: &mut [i64]) {
    match encoding {
        FrameEncoding::MethodsOnly => {
            for (word, frame) in words.iter_mut().zip(frames) {
                *word = MethodHandle::from_method_id(frame.method).raw();
            }
        }
        FrameEncoding::WithLocations => {
            for (pair, frame) in words.chunks_exact_mut(2).zip(frames) {
                pair[0] = MethodHandle::from_method_id(frame.method).raw();
                pair[1] = frame.location;
            }
        }
    }
}

/// Reads `count` frames back out of a buffer filled by [`capture_stack_trace`].
pub fn decode_frames(
    words: &[i64],
    count: usize,
    encoding: FrameEncoding,
) -> impl Iterator<Item = (MethodHandle, Option<Location>)> + '_ {
    words
        .chunks_exact(encoding.words_per_frame())
        .take(count)
        .map(move |frame| match encoding {
            FrameEncoding::MethodsOnly => (MethodHandle(frame[0]), None),
            FrameEncoding::WithLocations => (MethodHandle(frame[0]), Some(Location(frame[1]))),
        })
}

/// Declaring class of `method`, `None` when JVMTI cannot tell.
pub fn declaring_class<I>(jvmti: &I, method: MethodHandle) -> Option<jclass>
where
    I: Introspection + ?Sized,
{
    match jvmti.method_declaring_class(method.method_id()) {
        Ok(class) => Some(class),
        Err(err) => {
            debug!("GetMethodDeclaringClass({:#x}) failed: {}", method.raw(), err.0);
            None
        }
    }
}

/// Hands `f` the method's name, or name immediately followed by signature
/// (`run()V`) when `append_signature` is set. `None` when JVMTI cannot
/// resolve the method.
pub fn with_method_name<I, R>(
    jvmti: &I,
    method: MethodHandle,
    append_signature: bool,
    f: impl FnOnce(&CStr) -> R,
) -> Option<R>
where
    I: Introspection + ?Sized,
{
    let names = match jvmti.method_name(method.method_id(), append_signature) {
        Ok(names) => names,
        Err(err) => {
            debug!("GetMethodName({:#x}) failed: {}", method.raw(), err.0);
            return None;
        }
    };

    let signature = match (append_signature, names.signature.as_deref()) {
        (true, Some(signature)) => signature,
        _ => return Some(f(&*names.name)),
    };

    let name = names.name.to_bytes();
    let signature = signature.to_bytes_with_nul();
    let len = name.len() + signature.len();
    if len <= METHOD_NAME_STACK_BUFFER {
        let mut buf = [0u8; METHOD_NAME_STACK_BUFFER];
        concat(&mut buf[..len], name, signature).map(f)
    } else {
        let mut buf = vec![0u8; len];
        concat(&mut buf, name, signature).map(f)
    }
}

fn concat<'a>(buf: &'a mut [u8], name: &[u8], signature_with_nul: &[u8]) -> Option<&'a CStr> {
    let (head, tail) = buf.split_at_mut(name.len());
    head.copy_from_slice(name);
    tail.copy_from_slice(signature_with_nul);
    CStr::from_bytes_with_nul(buf).ok()
}
