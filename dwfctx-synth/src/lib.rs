// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic crash context files for testing.
//!
//! The builders here deliberately spell out the binary layout with raw
//! writes instead of going through dwfctx-common, so that an incorrect
//! change to the layouts there shows up as a test failure rather than as a
//! round trip that silently agrees with itself. It exists primarily as an
//! internal dev-dependency of dwfctx, but is published for the sake of
//! satisfying cargo-publish.
//!
//! Basic usage is to build up a [SynthContext][], then `finish()` it to get
//! the file contents. You can either write those to disk as an actual
//! context file or feed them directly to the dwfctx crate.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use dwfctx_common::format as fmt;
use scroll::ctx::SizeWith;
use scroll::LE;
use test_assembler::*;

/// A writer of synthetic context files.
///
/// The header fields default to the values a well-formed file carries;
/// the `with_*` methods replace them for tests that want a corrupt header.
pub struct SynthContext {
    endian: Endian,
    signature: u32,
    version: u16,
    arch: u16,
    /// An override for the header's thread count, for files whose header
    /// should disagree with the threads actually present.
    thread_count: Option<u32>,
    threads: Vec<Thread>,
}

impl SynthContext {
    /// Create a `SynthContext` with default endianness.
    pub fn new() -> SynthContext {
        SynthContext::with_endian(DEFAULT_ENDIAN)
    }

    /// Create a `SynthContext` with `endian` endianness.
    pub fn with_endian(endian: Endian) -> SynthContext {
        SynthContext {
            endian,
            signature: fmt::DWFCTX_SIGNATURE,
            version: fmt::DWFCTX_VERSION,
            arch: fmt::ContextArch::Bits64 as u16,
            thread_count: None,
            threads: Vec::new(),
        }
    }

    /// Use `signature` in the header instead of the real format signature.
    pub fn with_signature(mut self, signature: u32) -> SynthContext {
        self.signature = signature;
        self
    }

    /// Use `version` in the header instead of the current format version.
    pub fn with_version(mut self, version: u16) -> SynthContext {
        self.version = version;
        self
    }

    /// Use `arch` in the header as the raw architecture value.
    pub fn with_arch(mut self, arch: u16) -> SynthContext {
        self.arch = arch;
        self
    }

    /// Claim `thread_count` threads in the header regardless of how many
    /// were added.
    pub fn with_thread_count(mut self, thread_count: u32) -> SynthContext {
        self.thread_count = Some(thread_count);
        self
    }

    /// Append `thread` to this context file.
    pub fn add_thread(mut self, thread: Thread) -> SynthContext {
        self.threads.push(thread);
        self
    }

    /// Finish generating the context file and return the contents.
    pub fn finish(self) -> Option<Vec<u8>> {
        let thread_count = self.thread_count.unwrap_or(self.threads.len() as u32);
        let mut section = Section::with_endian(self.endian)
            .D32(self.signature)
            .D16(self.version)
            .D16(self.arch)
            .D32(thread_count);
        assert_eq!(section.size(), fmt::DWFCTX_HEADER::size_with(&LE) as u64);
        for thread in self.threads {
            section = section.append_section(thread.finish(self.endian));
        }
        section.get_contents()
    }
}

impl Default for SynthContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A single thread record and its frames.
pub struct Thread {
    thread_id: u32,
    crashed: u32,
    /// An override for the record's frame count, for records whose header
    /// should disagree with the frames actually present.
    frame_count: Option<u32>,
    frames: Vec<Frame>,
}

impl Thread {
    pub fn new(thread_id: u32, crashed: bool) -> Thread {
        Thread {
            thread_id,
            crashed: crashed as u32,
            frame_count: None,
            frames: Vec::new(),
        }
    }

    /// Use `crashed` as the raw value of the crashed flag. `Thread::new`
    /// only produces the well-formed values 0 and 1.
    pub fn with_raw_crashed(mut self, crashed: u32) -> Thread {
        self.crashed = crashed;
        self
    }

    /// Claim `frame_count` frames in the thread record regardless of how
    /// many were added.
    pub fn with_raw_frame_count(mut self, frame_count: u32) -> Thread {
        self.frame_count = Some(frame_count);
        self
    }

    /// Append `frame` to this thread's call stack.
    pub fn add_frame(mut self, frame: Frame) -> Thread {
        self.frames.push(frame);
        self
    }

    fn finish(self, endian: Endian) -> Section {
        let frame_count = self.frame_count.unwrap_or(self.frames.len() as u32);
        let mut section = Section::with_endian(endian)
            .D32(self.thread_id)
            .D32(self.crashed)
            .D32(frame_count);
        assert_eq!(section.size(), fmt::DWFCTX_THREAD::size_with(&LE) as u64);
        for frame in self.frames {
            section = section.append_section(frame.finish(endian));
        }
        section
    }
}

/// A single stack frame record.
pub struct Frame {
    frame_num: u32,
    func: Vec<u8>,
    regs: Vec<u64>,
    stack_base_addr: u64,
    stack: Vec<u8>,
}

impl Frame {
    pub fn new(frame_num: u32, func: &str) -> Frame {
        Frame {
            frame_num,
            func: func.as_bytes().to_vec(),
            regs: Vec::new(),
            stack_base_addr: 0,
            stack: Vec::new(),
        }
    }

    /// Use `func` as the raw bytes of the function description, which
    /// `Frame::new` would always store as valid UTF-8.
    pub fn with_raw_func(mut self, func: &[u8]) -> Frame {
        self.func = func.to_vec();
        self
    }

    /// Append `reg` to the frame's register values.
    pub fn add_reg(mut self, reg: u64) -> Frame {
        self.regs.push(reg);
        self
    }

    /// Set the frame's stack memory to `bytes` based at `base_addr`.
    pub fn set_stack(mut self, base_addr: u64, bytes: &[u8]) -> Frame {
        self.stack_base_addr = base_addr;
        self.stack = bytes.to_vec();
        self
    }

    fn finish(self, endian: Endian) -> Section {
        let mut section = Section::with_endian(endian)
            .D32(self.frame_num)
            .D32(self.func.len() as u32)
            .append_bytes(&self.func)
            .D32(self.regs.len() as u32);
        for reg in &self.regs {
            section = section.D64(*reg);
        }
        section
            .D64(self.stack_base_addr)
            .D32(self.stack.len() as u32)
            .append_bytes(&self.stack)
    }
}

#[test]
fn test_empty_context() {
    assert_eq!(
        SynthContext::new().finish().unwrap(),
        vec![0x44, 0x57, 0x46, 0x43, 1, 0, 1, 0, 0, 0, 0, 0]
    );
}

#[test]
fn test_big_endian_header() {
    assert_eq!(
        SynthContext::with_endian(Endian::Big).finish().unwrap(),
        vec![0x43, 0x46, 0x57, 0x44, 0, 1, 0, 1, 0, 0, 0, 0]
    );
}

#[test]
fn test_frame_layout() {
    let bytes = SynthContext::new()
        .add_thread(
            Thread::new(7, true)
                .add_frame(Frame::new(1, "ab").add_reg(0x10).set_stack(0x20, &[0xaa, 0xbb])),
        )
        .finish()
        .unwrap();
    assert_eq!(
        bytes,
        vec![
            0x44, 0x57, 0x46, 0x43, // signature
            1, 0, // version
            1, 0, // arch
            1, 0, 0, 0, // thread count
            7, 0, 0, 0, // thread id
            1, 0, 0, 0, // crashed
            1, 0, 0, 0, // frame count
            1, 0, 0, 0, // frame number
            2, 0, 0, 0, // func length
            b'a', b'b', // func
            1, 0, 0, 0, // register count
            0x10, 0, 0, 0, 0, 0, 0, 0, // register value
            0x20, 0, 0, 0, 0, 0, 0, 0, // stack base address
            2, 0, 0, 0, // stack size
            0xaa, 0xbb, // stack bytes
        ]
    );
}
