// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The in-memory representation of a crash context and the code to read and
//! write its on-disk form.
//!
//! A context file is a flat little-endian stream: a `DWFCTX_HEADER`, then one
//! record per thread, each thread followed immediately by its frame records.
//! [`ContextFile::read`] and [`ContextFile::write`] are exact inverses for
//! everything that is actually on the wire; the module list is carried in the
//! model only.

use std::cmp;
use std::fs::File;
use std::io::{self, Write};
use std::mem;
use std::path::Path;
use std::str;

use memmap2::Mmap;
use num_traits::FromPrimitive;
use scroll::ctx::SizeWith;
use scroll::{IOwrite, Pread, LE};

use dwfctx_common::format as fmt;
use dwfctx_common::format::ContextArch;

/// Errors encountered while reading a context file.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error")]
    IoError,
    #[error("Missing context file header (empty file?)")]
    MissingHeader,
    #[error("Header mismatch")]
    HeaderMismatch,
    #[error("Context file version mismatch")]
    VersionMismatch,
    #[error("Error reading thread record")]
    ThreadReadFailure,
    #[error("Error reading frame record")]
    FrameReadFailure,
    #[error("Record size mismatch: expected {expected} bytes, found {actual} bytes")]
    RecordSizeMismatch { expected: usize, actual: usize },
    #[error("Data error")]
    DataError,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::MissingHeader => "MissingHeader",
            Error::HeaderMismatch => "HeaderMismatch",
            Error::VersionMismatch => "VersionMismatch",
            Error::ThreadReadFailure => "ThreadReadFailure",
            Error::FrameReadFailure => "FrameReadFailure",
            Error::RecordSizeMismatch { .. } => "RecordSizeMismatch",
            Error::DataError => "DataError",
        }
    }
}

/// A single stack frame recovered by the stackwalker.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextFrame {
    /// The position of this frame in its thread's call stack, 0 being the
    /// innermost frame.
    pub frame_num: u32,
    /// The frame's description exactly as the stackwalker printed it,
    /// typically `module!function + offset` or a bare address. May be empty.
    pub func: String,
    /// Register values in the order they appeared in the report. A register
    /// whose value failed to parse holds [`BAD_REGISTER`](crate::report::BAD_REGISTER).
    pub regs: Vec<u64>,
    /// The address the first captured stack byte was read from, or 0 if no
    /// stack memory was captured for this frame.
    pub stack_base_addr: u64,
    /// Raw stack memory captured for this frame.
    pub stack: Vec<u8>,
}

impl ContextFrame {
    /// Create a `ContextFrame` with no registers and no stack memory.
    pub fn new<S: Into<String>>(frame_num: u32, func: S) -> ContextFrame {
        ContextFrame {
            frame_num,
            func: func.into(),
            regs: Vec::new(),
            stack_base_addr: 0,
            stack: Vec::new(),
        }
    }

    /// Write a human-readable description of this frame to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            r#"  frame_num       = {}
  func            = "{}"
  reg_count       = {}
"#,
            self.frame_num,
            self.func,
            self.regs.len(),
        )?;
        for (i, reg) in self.regs.iter().enumerate() {
            writeln!(f, "    reg[{:2}] = {:#018x}", i, reg)?;
        }
        write!(
            f,
            r#"  stack_base_addr = {:#x}
  stack_size      = {}
"#,
            self.stack_base_addr,
            self.stack.len(),
        )?;
        self.print_stack_contents(f)?;
        writeln!(f)
    }

    /// Write the raw stack bytes of this frame to `f` as a hex dump.
    pub fn print_stack_contents<T: Write>(&self, f: &mut T) -> io::Result<()> {
        const PARAGRAPH_SIZE: usize = 16;
        let mut offset = 0;
        for paragraph in self.stack.chunks(PARAGRAPH_SIZE) {
            write!(f, "    {:08x}: ", offset)?;
            let mut byte_iter = paragraph.iter().fuse();
            for _ in 0..PARAGRAPH_SIZE {
                if let Some(byte) = byte_iter.next() {
                    write!(f, "{:02x} ", byte)?;
                } else {
                    write!(f, "   ")?;
                }
            }
            for &byte in paragraph.iter() {
                let ascii_char = if !byte.is_ascii() || byte.is_ascii_control() {
                    '.'
                } else {
                    char::from(byte)
                };

                write!(f, "{}", ascii_char)?;
            }
            writeln!(f)?;

            offset += PARAGRAPH_SIZE;
        }
        Ok(())
    }
}

/// A thread of the crashed process and the frames recovered for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextThread {
    /// The identifier of this thread as reported by the stackwalker.
    pub thread_id: u32,
    /// Whether this is the thread that crashed.
    pub crashed: bool,
    /// The thread's frames, innermost first, in report order.
    pub frames: Vec<ContextFrame>,
}

impl ContextThread {
    /// Create a `ContextThread` with no frames.
    pub fn new(thread_id: u32, crashed: bool) -> ContextThread {
        ContextThread {
            thread_id,
            crashed,
            frames: Vec::new(),
        }
    }

    /// Write a human-readable description of this thread to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            r#"DWFCTX_THREAD
  thread_id   = {:#x}
  crashed     = {}
  frame_count = {}

"#,
            self.thread_id,
            self.crashed,
            self.frames.len(),
        )?;
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "frame[{}]", i)?;
            frame.print(f)?;
        }
        Ok(())
    }
}

/// A module that was loaded in the crashed process.
///
/// The context file format does not have a module section yet, so these are
/// never encoded or decoded; the model carries the list so a future format
/// version can populate it without reshaping the API.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextModule {
    /// The module's filename.
    pub name: String,
    /// The address the module was loaded at.
    pub base_addr: u64,
    /// The size of the module's mapping.
    pub size: u64,
}

/// The full contents of a crash context: every thread the stackwalker
/// recovered, with registers and stack memory per frame.
///
/// Produced either by [`parse_report`](crate::report::parse_report) from
/// stackwalker text or by [`ContextFile::read`] from an encoded file, and
/// consumed by [`ContextFile::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextFile {
    /// The pointer width of the crashed process. [`parse_report`](crate::report::parse_report)
    /// always produces [`ContextArch::Bits64`].
    pub arch: ContextArch,
    /// The threads of the crashed process, in report order.
    pub threads: Vec<ContextThread>,
    /// Loaded modules. Not on the wire; see [`ContextModule`].
    pub modules: Vec<ContextModule>,
}

impl Default for ContextFile {
    fn default() -> ContextFile {
        ContextFile {
            arch: ContextArch::Bits64,
            threads: Vec::new(),
            modules: Vec::new(),
        }
    }
}

impl ContextFile {
    /// Read a `ContextFile` from a `Path` to a file on disk.
    pub fn read_path<P>(path: P) -> Result<ContextFile, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        ContextFile::read(&mmap)
    }

    /// Read a `ContextFile` from the encoded `bytes`.
    ///
    /// Every byte of `bytes` must belong to the context file; trailing data
    /// is an error.
    pub fn read(bytes: &[u8]) -> Result<ContextFile, Error> {
        let mut offset = 0;
        let header: fmt::DWFCTX_HEADER = bytes
            .gread_with(&mut offset, LE)
            .or(Err(Error::MissingHeader))?;
        if header.signature != fmt::DWFCTX_SIGNATURE {
            return Err(Error::HeaderMismatch);
        }
        if header.version != fmt::DWFCTX_VERSION {
            return Err(Error::VersionMismatch);
        }
        let arch = ContextArch::from_u16(header.arch).ok_or(Error::DataError)?;

        let (thread_count, _) = ensure_count_in_bound(
            bytes,
            header.thread_count as usize,
            fmt::DWFCTX_THREAD::size_with(&LE),
            offset,
        )?;

        let mut threads = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            threads.push(read_thread(bytes, &mut offset)?);
        }

        if offset != bytes.len() {
            return Err(Error::RecordSizeMismatch {
                expected: offset,
                actual: bytes.len(),
            });
        }

        Ok(ContextFile {
            arch,
            threads,
            modules: Vec::new(),
        })
    }

    /// Write this context in its on-disk form to `f`, returning the number
    /// of threads encoded.
    ///
    /// `limit` caps the number of threads encoded, counted from the front of
    /// [`threads`](#structfield.threads); `None` encodes every thread, and
    /// `Some(0)` produces a valid file holding nothing but a header. The
    /// header's `thread_count` always matches the number of thread records
    /// actually written, and threads past the cap are not visited at all.
    pub fn write<T: Write>(&self, f: &mut T, limit: Option<usize>) -> io::Result<usize> {
        let thread_count = match limit {
            Some(limit) => cmp::min(limit, self.threads.len()),
            None => self.threads.len(),
        };

        f.iowrite_with(
            fmt::DWFCTX_HEADER {
                signature: fmt::DWFCTX_SIGNATURE,
                version: fmt::DWFCTX_VERSION,
                arch: self.arch as u16,
                thread_count: thread_count as u32,
            },
            LE,
        )?;

        for thread in &self.threads[..thread_count] {
            write_thread(f, thread)?;
        }
        Ok(thread_count)
    }

    /// Write a human-readable description of this context to `f`.
    ///
    /// This is fairly verbose, in the style of a raw dump tool; it is what
    /// `dwfctx-convert --dump` prints.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            r#"DWFCTX_HEADER
  signature    = {:#010x}
  version      = {}
  arch         = {:?}
  thread_count = {}

"#,
            fmt::DWFCTX_SIGNATURE,
            fmt::DWFCTX_VERSION,
            self.arch,
            self.threads.len(),
        )?;
        for (i, thread) in self.threads.iter().enumerate() {
            writeln!(f, "thread[{}]", i)?;
            thread.print(f)?;
        }
        Ok(())
    }
}

/// Check that `number_of_entries` records of at least `size_of_entry` bytes
/// each can fit in `buf` after `offset`, to avoid allocating on a bogus count.
fn ensure_count_in_bound(
    buf: &[u8],
    number_of_entries: usize,
    size_of_entry: usize,
    offset: usize,
) -> Result<(usize, usize), Error> {
    let expected_size = number_of_entries
        .checked_mul(size_of_entry)
        .and_then(|v| v.checked_add(offset))
        .ok_or(Error::DataError)?;
    if buf.len() < expected_size {
        return Err(Error::RecordSizeMismatch {
            expected: expected_size,
            actual: buf.len(),
        });
    }
    Ok((number_of_entries, expected_size))
}

fn read_thread(bytes: &[u8], offset: &mut usize) -> Result<ContextThread, Error> {
    let raw: fmt::DWFCTX_THREAD = bytes
        .gread_with(offset, LE)
        .or(Err(Error::ThreadReadFailure))?;
    let crashed = match raw.crashed {
        0 => false,
        1 => true,
        _ => return Err(Error::DataError),
    };

    // The smallest possible frame record is an empty func with no registers
    // and no stack memory.
    let min_frame_size = fmt::DWFCTX_FRAME_HEADER::size_with(&LE)
        + mem::size_of::<u32>()
        + fmt::DWFCTX_STACK_DESCRIPTOR::size_with(&LE);
    let (frame_count, _) =
        ensure_count_in_bound(bytes, raw.frame_count as usize, min_frame_size, *offset)?;

    let mut frames = Vec::with_capacity(frame_count);
    for _ in 0..frame_count {
        frames.push(read_frame(bytes, offset)?);
    }

    Ok(ContextThread {
        thread_id: raw.thread_id,
        crashed,
        frames,
    })
}

fn read_frame(bytes: &[u8], offset: &mut usize) -> Result<ContextFrame, Error> {
    let raw: fmt::DWFCTX_FRAME_HEADER = bytes
        .gread_with(offset, LE)
        .or(Err(Error::FrameReadFailure))?;

    let (func_len, _) = ensure_count_in_bound(bytes, raw.func_len as usize, 1, *offset)?;
    let func_bytes: &[u8] = bytes
        .gread_with(offset, func_len)
        .or(Err(Error::FrameReadFailure))?;
    let func = str::from_utf8(func_bytes).or(Err(Error::DataError))?;

    let reg_count: u32 = bytes
        .gread_with(offset, LE)
        .or(Err(Error::FrameReadFailure))?;
    let (reg_count, _) =
        ensure_count_in_bound(bytes, reg_count as usize, mem::size_of::<u64>(), *offset)?;
    let mut regs: Vec<u64> = Vec::with_capacity(reg_count);
    for _ in 0..reg_count {
        regs.push(
            bytes
                .gread_with(offset, LE)
                .or(Err(Error::FrameReadFailure))?,
        );
    }

    let raw_stack: fmt::DWFCTX_STACK_DESCRIPTOR = bytes
        .gread_with(offset, LE)
        .or(Err(Error::FrameReadFailure))?;
    let (stack_len, _) = ensure_count_in_bound(bytes, raw_stack.data_size as usize, 1, *offset)?;
    let stack_bytes: &[u8] = bytes
        .gread_with(offset, stack_len)
        .or(Err(Error::FrameReadFailure))?;

    Ok(ContextFrame {
        frame_num: raw.frame_num,
        func: func.to_string(),
        regs,
        stack_base_addr: raw_stack.base_addr,
        stack: stack_bytes.to_vec(),
    })
}

fn write_thread<T: Write>(f: &mut T, thread: &ContextThread) -> io::Result<()> {
    f.iowrite_with(
        fmt::DWFCTX_THREAD {
            thread_id: thread.thread_id,
            crashed: thread.crashed as u32,
            frame_count: thread.frames.len() as u32,
        },
        LE,
    )?;
    for frame in &thread.frames {
        write_frame(f, frame)?;
    }
    Ok(())
}

fn write_frame<T: Write>(f: &mut T, frame: &ContextFrame) -> io::Result<()> {
    f.iowrite_with(
        fmt::DWFCTX_FRAME_HEADER {
            frame_num: frame.frame_num,
            func_len: frame.func.len() as u32,
        },
        LE,
    )?;
    f.write_all(frame.func.as_bytes())?;

    f.iowrite_with(frame.regs.len() as u32, LE)?;
    for &reg in &frame.regs {
        f.iowrite_with(reg, LE)?;
    }

    f.iowrite_with(
        fmt::DWFCTX_STACK_DESCRIPTOR {
            base_addr: frame.stack_base_addr,
            data_size: frame.stack.len() as u32,
        },
        LE,
    )?;
    f.write_all(&frame.stack)
}

#[cfg(test)]
mod test {
    use super::*;
    use dwfctx_synth::{Frame, SynthContext, Thread};
    use test_assembler::Endian;

    fn read_synth_context(context: SynthContext) -> Result<ContextFile, Error> {
        let bytes = context.finish().ok_or(Error::FileNotFound)?;
        ContextFile::read(&bytes)
    }

    fn sample_context() -> ContextFile {
        let mut frame0 = ContextFrame::new(0, "libc.so!memcpy");
        frame0.regs = vec![0x10, 0x20];
        frame0.stack_base_addr = 0x7000;
        frame0.stack = vec![1, 2, 3];
        let frame1 = ContextFrame::new(1, "app!main + 0x2c");
        let mut thread0 = ContextThread::new(3, true);
        thread0.frames = vec![frame0, frame1];

        let mut frame2 = ContextFrame::new(0, "møøse::grunt");
        frame2.regs = vec![u64::MAX, 0x7fff_ffff_dead_beef];
        let mut thread1 = ContextThread::new(8, false);
        thread1.frames = vec![frame2];

        ContextFile {
            threads: vec![thread0, thread1],
            ..ContextFile::default()
        }
    }

    #[test]
    fn test_read_empty() {
        assert_eq!(ContextFile::read(&[]), Err(Error::MissingHeader));
    }

    #[test]
    fn test_header_mismatch() {
        let context = SynthContext::new().with_signature(0x12345678);
        assert_eq!(read_synth_context(context), Err(Error::HeaderMismatch));
    }

    #[test]
    fn test_big_endian_rejected() {
        // The signature bytes come out reversed, which must not read back.
        let context = SynthContext::with_endian(Endian::Big);
        assert_eq!(read_synth_context(context), Err(Error::HeaderMismatch));
    }

    #[test]
    fn test_version_mismatch() {
        let context = SynthContext::new().with_version(2);
        assert_eq!(read_synth_context(context), Err(Error::VersionMismatch));
    }

    #[test]
    fn test_bad_arch() {
        let context = SynthContext::new().with_arch(7);
        assert_eq!(read_synth_context(context), Err(Error::DataError));
    }

    #[test]
    fn test_empty_context() {
        let file = read_synth_context(SynthContext::new()).unwrap();
        assert_eq!(file.arch, ContextArch::Bits64);
        assert!(file.threads.is_empty());
        assert!(file.modules.is_empty());
    }

    #[test]
    fn test_arch_bits32_accepted() {
        let context = SynthContext::new().with_arch(0);
        let file = read_synth_context(context).unwrap();
        assert_eq!(file.arch, ContextArch::Bits32);
    }

    #[test]
    fn test_bad_crashed_flag() {
        let context = SynthContext::new().add_thread(Thread::new(1, false).with_raw_crashed(7));
        assert_eq!(read_synth_context(context), Err(Error::DataError));
    }

    #[test]
    fn test_bad_func_utf8() {
        let frame = Frame::new(0, "").with_raw_func(&[0xff, 0xfe, 0x01]);
        let context = SynthContext::new().add_thread(Thread::new(1, true).add_frame(frame));
        assert_eq!(read_synth_context(context), Err(Error::DataError));
    }

    #[test]
    fn test_thread_count_exceeds_data() {
        let context = SynthContext::new().with_thread_count(1000);
        assert!(matches!(
            read_synth_context(context),
            Err(Error::RecordSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_count_exceeds_data() {
        let context = SynthContext::new().add_thread(Thread::new(1, false).with_raw_frame_count(5));
        assert!(matches!(
            read_synth_context(context),
            Err(Error::RecordSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage() {
        let mut bytes = SynthContext::new()
            .add_thread(Thread::new(1, false))
            .finish()
            .unwrap();
        bytes.push(0);
        assert!(matches!(
            ContextFile::read(&bytes),
            Err(Error::RecordSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_truncation() {
        let mut bytes = Vec::new();
        sample_context().write(&mut bytes, None).unwrap();
        // No strict prefix of a valid file is a valid file.
        for len in 0..bytes.len() {
            assert!(
                ContextFile::read(&bytes[..len]).is_err(),
                "prefix of {} bytes unexpectedly read back",
                len
            );
        }
        assert_eq!(ContextFile::read(&bytes[..4]), Err(Error::MissingHeader));
    }

    #[test]
    fn test_round_trip() {
        let file = sample_context();
        let mut bytes = Vec::new();
        file.write(&mut bytes, None).unwrap();
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_round_trip_empty_frame() {
        let mut thread = ContextThread::new(42, false);
        thread.frames = vec![ContextFrame::new(0, "")];
        let file = ContextFile {
            threads: vec![thread],
            ..ContextFile::default()
        };
        let mut bytes = Vec::new();
        file.write(&mut bytes, None).unwrap();
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.threads[0].frames[0].func, "");
        assert!(decoded.threads[0].frames[0].regs.is_empty());
        assert!(decoded.threads[0].frames[0].stack.is_empty());
    }

    #[test]
    fn test_round_trip_trailing_empty_stack() {
        // The file ends on a stack descriptor with no data bytes after it;
        // the reader must agree the file ends exactly there.
        let mut frame = ContextFrame::new(0, "app!spin");
        frame.regs = vec![0x1000];
        let mut thread = ContextThread::new(5, true);
        thread.frames = vec![frame];
        let file = ContextFile {
            threads: vec![thread],
            ..ContextFile::default()
        };
        let mut bytes = Vec::new();
        file.write(&mut bytes, None).unwrap();
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.threads[0].frames[0].stack_base_addr, 0);
        assert!(decoded.threads[0].frames[0].stack.is_empty());
    }

    #[test]
    fn test_write_limit() {
        let file = sample_context();

        let mut bytes = Vec::new();
        assert_eq!(file.write(&mut bytes, Some(1)).unwrap(), 1);
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded.threads, file.threads[..1]);

        let mut bytes = Vec::new();
        assert_eq!(file.write(&mut bytes, Some(0)).unwrap(), 0);
        let decoded = ContextFile::read(&bytes).unwrap();
        assert!(decoded.threads.is_empty());

        let mut bytes = Vec::new();
        assert_eq!(file.write(&mut bytes, Some(99)).unwrap(), 2);
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded.threads, file.threads);

        let mut bytes = Vec::new();
        assert_eq!(file.write(&mut bytes, None).unwrap(), 2);
    }

    #[test]
    fn test_header_bytes() {
        let mut bytes = Vec::new();
        ContextFile::default().write(&mut bytes, None).unwrap();
        assert_eq!(
            bytes,
            // 'DWFC', version 1, arch 1, thread_count 0
            vec![0x44, 0x57, 0x46, 0x43, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_matches_synth_layout() {
        let file = sample_context();
        let mut bytes = Vec::new();
        file.write(&mut bytes, None).unwrap();

        let synth = SynthContext::new()
            .add_thread(
                Thread::new(3, true)
                    .add_frame(
                        Frame::new(0, "libc.so!memcpy")
                            .add_reg(0x10)
                            .add_reg(0x20)
                            .set_stack(0x7000, &[1, 2, 3]),
                    )
                    .add_frame(Frame::new(1, "app!main + 0x2c")),
            )
            .add_thread(
                Thread::new(8, false).add_frame(
                    Frame::new(0, "møøse::grunt")
                        .add_reg(u64::MAX)
                        .add_reg(0x7fff_ffff_dead_beef),
                ),
            );
        assert_eq!(bytes, synth.finish().unwrap());
    }

    #[test]
    fn test_round_trip_bad_register_sentinel() {
        let file = sample_context();
        let mut bytes = Vec::new();
        file.write(&mut bytes, None).unwrap();
        let decoded = ContextFile::read(&bytes).unwrap();
        assert_eq!(decoded.threads[1].frames[0].regs[0], u64::MAX);
    }

    #[test]
    fn test_print() {
        let mut out = Vec::new();
        sample_context().print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("DWFCTX_HEADER"));
        assert!(text.contains("thread_count = 2"));
        assert!(text.contains("thread_id   = 0x3"));
        assert!(text.contains("func            = \"libc.so!memcpy\""));
        assert!(text.contains("stack_base_addr = 0x7000"));
        assert!(text.contains("01 02 03"));
    }
}
