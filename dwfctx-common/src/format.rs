//! Crash context structure definitions.
//!
//! A context file is a flat little-endian serialization of the call stacks
//! that a minidump stackwalker recovered from a crash: a header followed by
//! one record per thread, each thread followed by its frame records. There
//! is no stream directory and no padding; every record follows the previous
//! one immediately.
#![allow(non_camel_case_types)]

use enum_primitive_derive::Primitive;
use scroll::{IOwrite, Pread, Pwrite, SizeWith};

/// The 4-byte magic number at the start of a context file.
///
/// In little endian this spells 'DWFC'.
pub const DWFCTX_SIGNATURE: u32 = 0x43465744;

/// The version of the context file format.
pub const DWFCTX_VERSION: u16 = 1;

/// The header at the start of a context file.
#[derive(Debug, Clone, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DWFCTX_HEADER {
    /// This should be [`DWFCTX_SIGNATURE`][signature].
    ///
    /// [signature]: constant.DWFCTX_SIGNATURE.html
    pub signature: u32,
    /// This should be [`DWFCTX_VERSION`][version].
    ///
    /// [version]: constant.DWFCTX_VERSION.html
    pub version: u16,
    /// The pointer width of the crashed process, one of [`ContextArch`][arch].
    ///
    /// [arch]: enum.ContextArch.html
    pub arch: u16,
    /// The number of [`DWFCTX_THREAD`][thread] records that follow the header.
    ///
    /// [thread]: struct.DWFCTX_THREAD.html
    pub thread_count: u32,
}

/// The fixed-width prefix of a thread record.
///
/// Followed immediately by `frame_count` frame records, each starting with a
/// [`DWFCTX_FRAME_HEADER`](struct.DWFCTX_FRAME_HEADER.html).
#[derive(Debug, Clone, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DWFCTX_THREAD {
    /// The identifier of this thread as reported by the stackwalker.
    pub thread_id: u32,
    /// 1 if this is the thread that crashed, 0 otherwise.
    pub crashed: u32,
    /// The number of frame records belonging to this thread.
    pub frame_count: u32,
}

/// The fixed-width prefix of a frame record.
///
/// The full frame record is laid out as:
///
/// ```text
/// DWFCTX_FRAME_HEADER
/// func bytes               [func_len]      UTF-8, not NUL-terminated
/// reg_count                u32
/// regs                     [reg_count] x u64
/// DWFCTX_STACK_DESCRIPTOR
/// stack bytes              [data_size]
/// ```
#[derive(Debug, Clone, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DWFCTX_FRAME_HEADER {
    /// The position of this frame in its thread's call stack, 0 being the
    /// innermost frame.
    pub frame_num: u32,
    /// The length in bytes of the UTF-8 function description that follows.
    pub func_len: u32,
}

/// A frame's captured stack memory: a base address and a byte length,
/// followed immediately by that many raw bytes.
#[derive(Debug, Copy, Default, Clone, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DWFCTX_STACK_DESCRIPTOR {
    /// The address the first captured stack byte was read from, or 0 if no
    /// stack memory was captured for this frame.
    pub base_addr: u64,
    /// The number of raw stack bytes that follow.
    pub data_size: u32,
}

/// Known values of [`DWFCTX_HEADER::arch`](struct.DWFCTX_HEADER.html).
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum ContextArch {
    /// The crashed process used 32-bit pointers.
    Bits32 = 0,
    /// The crashed process used 64-bit pointers.
    Bits64 = 1,
}
