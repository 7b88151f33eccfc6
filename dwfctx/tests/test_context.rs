// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use dwfctx::*;
use std::fs;
use std::path::PathBuf;

fn get_test_report_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(file!());
    path.pop();
    path.pop();
    path.pop();
    path.push("../");
    path.push("testdata");
    path.push(filename);
    println!("{:?}", path);
    path
}

fn read_test_report() -> String {
    let path = get_test_report_path("test-report.txt");
    fs::read_to_string(path).unwrap()
}

#[test]
fn test_parse_test_report() {
    let context = parse_report(&read_test_report());

    assert_eq!(context.arch, ContextArch::Bits64);
    assert_eq!(context.threads.len(), 2);

    let thread = &context.threads[0];
    assert_eq!(thread.thread_id, 0);
    assert!(thread.crashed);
    assert_eq!(thread.frames.len(), 3);

    let frame = &thread.frames[0];
    assert_eq!(frame.frame_num, 0);
    assert_eq!(frame.func, "libc-2.31.so!__memcpy_avx_unaligned_erms + 0x1c");
    assert_eq!(frame.regs.len(), 17);
    assert_eq!(frame.regs[0], 0x7f0b_e4d4_7900);
    assert_eq!(frame.regs[16], 0x7f0b_e4e9_375c);
    assert_eq!(frame.stack_base_addr, 0x7ffe_9628_dd18);
    assert_eq!(frame.stack.len(), 48);
    assert_eq!(frame.stack[0], 0x60);
    assert_eq!(frame.stack[8], 0x40);
    assert_eq!(frame.stack[47], 0x00);

    let frame = &thread.frames[1];
    assert_eq!(frame.frame_num, 1);
    assert_eq!(
        frame.func,
        "converter!copy_payload(unsigned char const*, unsigned long) + 0x4b"
    );
    assert_eq!(frame.regs.len(), 3);
    assert_eq!(frame.stack_base_addr, 0x7ffe_9628_dd50);
    assert_eq!(frame.stack.len(), 16);

    let frame = &thread.frames[2];
    assert_eq!(frame.frame_num, 2);
    assert_eq!(frame.func, "converter!main + 0x170");
    assert_eq!(frame.regs.len(), 3);
    assert_eq!(frame.stack_base_addr, 0);
    assert!(frame.stack.is_empty());

    let thread = &context.threads[1];
    assert_eq!(thread.thread_id, 1);
    assert!(!thread.crashed);
    assert_eq!(thread.frames.len(), 2);
    assert_eq!(
        thread.frames[0].func,
        "libpthread-2.31.so!__pthread_cond_wait + 0x216"
    );
    assert_eq!(thread.frames[0].regs.len(), 3);
    assert_eq!(thread.frames[1].func, "converter!worker_loop() + 0x87");
    assert_eq!(thread.frames[1].regs, vec![0x5580_f204_bb10]);
}

#[test]
fn test_strict_parse_matches_lenient() {
    let report = read_test_report();
    let strict = parse_report_strict(&report).unwrap();
    assert_eq!(strict, parse_report(&report));
}

#[test]
fn test_convert_round_trip() {
    let context = parse_report(&read_test_report());

    let mut bytes = Vec::new();
    context.write(&mut bytes, None).unwrap();
    let decoded = ContextFile::read(&bytes).unwrap();
    assert_eq!(decoded, context);
}

#[test]
fn test_convert_with_limit() {
    let context = parse_report(&read_test_report());

    let mut bytes = Vec::new();
    assert_eq!(context.write(&mut bytes, Some(1)).unwrap(), 1);
    let decoded = ContextFile::read(&bytes).unwrap();
    assert_eq!(decoded.threads.len(), 1);
    assert_eq!(decoded.threads[0], context.threads[0]);

    // A limit past the end encodes everything.
    let mut bytes = Vec::new();
    assert_eq!(context.write(&mut bytes, Some(99)).unwrap(), 2);
    let decoded = ContextFile::read(&bytes).unwrap();
    assert_eq!(decoded.threads.len(), 2);
}

#[test]
fn test_print_test_report() {
    let context = parse_report(&read_test_report());

    let mut printed = Vec::new();
    context.print(&mut printed).unwrap();
    let printed = String::from_utf8(printed).unwrap();
    assert!(printed.contains("DWFCTX_HEADER"));
    assert!(printed.contains("thread_count = 2"));
    assert!(printed.contains("libc-2.31.so!__memcpy_avx_unaligned_erms + 0x1c"));
    // The crashing thread's stack memory is hex-dumped.
    assert!(printed.contains("60 c3 04 f2 80 55 00 00 40 dd 28 96 fe 7f 00 00"));
}
