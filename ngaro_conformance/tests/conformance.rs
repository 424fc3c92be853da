// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end conformance scenarios: assembled programs run on a fresh
//! instance, with the observable machine state checked afterwards.

use ngaro_vm::asm::assemble;
use ngaro_vm::cell::{CELL_BITS, Cell};
use ngaro_vm::image::{self, CellWidth, CodecError};
use ngaro_vm::vm::{Instance, Machine};

fn run_asm(name: &str, src: &str) -> Instance {
    run_asm_with_stack(name, src, &[])
}

fn run_asm_with_stack(name: &str, src: &str, stack: &[Cell]) -> Instance {
    let img = assemble(name, src).unwrap_or_else(|e| panic!("{e}"));
    let mut i = Instance::new(img, "");
    for &v in stack {
        i.machine_mut().push(v).unwrap();
    }
    if let Err(e) = i.run() {
        panic!("{name}: {e}");
    }
    i
}

/// Checks the PC (`None` means the image length), the data stack and the
/// address stack after the run.
#[track_caller]
fn check(name: &str, i: &Instance, pc: Option<usize>, data: &[Cell], address: &[Cell]) {
    let m = i.machine();
    let want_pc = pc.unwrap_or(m.image().len());
    assert_eq!(m.pc(), want_pc, "{name}: bad pc");
    assert_eq!(m.data(), data, "{name}: data stack");
    assert_eq!(m.address(), address, "{name}: address stack");
}

#[test]
fn opcode_table() {
    struct Case {
        name: &'static str,
        code: &'static str,
        data: &'static [Cell],
        address: &'static [Cell],
    }
    let cases = [
        Case { name: "nop", code: "nop", data: &[], address: &[] },
        Case { name: "lit", code: "lit 25", data: &[25], address: &[] },
        Case { name: "dup", code: "1234 dup", data: &[1234, 1234], address: &[] },
        Case { name: "drop", code: "50 drop", data: &[], address: &[] },
        Case { name: "swap", code: "50 60 swap", data: &[60, 50], address: &[] },
        Case { name: "push", code: "82 push", data: &[], address: &[82] },
        Case { name: "pop", code: "82 push pop", data: &[82], address: &[] },
        Case { name: "loop", code: "3 :REPEAT dup push loop REPEAT", data: &[], address: &[3, 2, 1] },
        Case { name: "jump", code: "1 2 jump OVER 3 4 5 :OVER 6 7", data: &[1, 2, 6, 7], address: &[] },
        Case { name: "<jump", code: "2 1 <jump END 12 1 2 <jump END 21 :END", data: &[12], address: &[] },
        Case { name: ">jump", code: "1 2 >jump END 21 2 1 >jump END 12 :END", data: &[21], address: &[] },
        Case { name: "!jump", code: "1 1 !jump END 11 1 0 !jump END 10 :END", data: &[11], address: &[] },
        Case { name: "=jump", code: "1 0 =jump END 10 1 1 =jump END 11 :END", data: &[10], address: &[] },
        Case { name: "+", code: "2 3 +    2 -3 +", data: &[5, -1], address: &[] },
        Case { name: "-", code: "2 1 -   1 2 -   1 -2 -   -1 -2 -", data: &[1, -1, 3, 1], address: &[] },
        Case { name: "*", code: "0 5 *   1 5 *   5 5 *", data: &[0, 5, 25], address: &[] },
        Case { name: "/mod", code: "25 5 /mod  26 5 /mod", data: &[0, 5, 1, 5], address: &[] },
        Case { name: "1+", code: "-1 1+   0 1+    1 1+", data: &[0, 1, 2], address: &[] },
        Case { name: "1-", code: "-1 1-    0 1-   1 1-", data: &[-2, -1, 0], address: &[] },
        Case { name: "and", code: "0 0 and  0 1 and   1 0 and  1 1 and", data: &[0, 0, 0, 1], address: &[] },
        Case { name: "or", code: "0 0 or   0 1 or   1 0 or   1 1 or", data: &[0, 1, 1, 1], address: &[] },
        Case { name: "xor", code: "0 0 xor   0 1 xor   1 0 xor   1 1 xor   -1 3 xor", data: &[0, 1, 1, 0, -4], address: &[] },
        Case { name: "<<", code: "1 1 <<   2 1 <<   3 1 <<   0 2 <<   -1 2 <<  -3 4 <<", data: &[2, 4, 6, 0, -4, -48], address: &[] },
        Case { name: ">>", code: "2 1 >>   4 1 >>   6 1 >>   0 2 >>   -4 2 >>   -48 4 >>", data: &[1, 2, 3, 0, -1, -3], address: &[] },
        Case { name: "@", code: "1234 drop   0 @   1 @", data: &[1, 1234], address: &[] },
        Case { name: "!", code: "42 lit foo 1+ ! :foo lit 0", data: &[42], address: &[] },
        Case { name: "io", code: "-1 5 out wait 5 in", data: &[9], address: &[] },
    ];
    for case in cases {
        let i = run_asm(case.name, case.code);
        check(case.name, &i, None, case.data, case.address);
    }
}

#[test]
fn call_and_return_through_low_address_expansion() {
    // A bare label below the reserved opcode range expands to
    // `lit resume push jump`, so the resume address lands on the address
    // stack instead of a call cell.
    let i = run_asm("call", "func .org 32 :func 1 2");
    check("call", &i, None, &[1, 2], &[4]);

    let i = run_asm("return", "func end .org 32 :func -2 ; :end -1");
    check("return", &i, None, &[-2, -1], &[9]);
}

#[test]
fn zero_exit_returns_only_on_zero() {
    let i = run_asm(
        "zero_exit",
        "fallthrough return quit
         .org 32
         :fallthrough 0 1 0;
         :return     -1 0 0;
         :quit",
    );
    check("zero_exit", &i, None, &[0, 1, -1, -1], &[14]);
}

#[test]
fn scenario_arithmetic() {
    let i = run_asm("arith", "2 3 +");
    check("arith", &i, None, &[5], &[]);
}

#[test]
fn scenario_conditional_branch() {
    let i = run_asm("cond", "2 1 <jump END 12 1 2 <jump END 21 :END");
    check("cond", &i, None, &[12], &[]);
}

const FIB_LOOP: &str = "
    ( loop fib -- n-n )
    push 0 1
    jump 1+
:0  push            ( save ctr )
    dup push        ( save fib of n-1 )
    +
    pop swap        ( stack: fib of n-2, fib of n-1 )
:1  pop
    loop 0-
    swap
    drop
";

const FIB_RECURSIVE: &str = "
    ( recursive fib )
    fib
    jump end
.org 32
:fib
    dup 1 >jump 0+ ;
:0  1- dup fib swap
    1- fib
    + ;
:end
";

#[test]
fn scenario_fibonacci_loop() {
    let i = run_asm_with_stack("fib_loop", FIB_LOOP, &[30]);
    check("fib_loop", &i, None, &[832_040], &[]);
}

#[test]
fn scenario_fibonacci_recursive() {
    let i = run_asm_with_stack("fib_rec", FIB_RECURSIVE, &[30]);
    check("fib_rec", &i, None, &[832_040], &[]);
}

#[test]
fn scenario_fibonacci_custom_opcode() {
    let img = assemble("fib_opcode", ".opcode fib -1\nfib").unwrap();
    let mut i = Instance::new(img, "");
    i.machine_mut().push(30).unwrap();
    i.bind_opcode_handler(|m: &mut Machine, opcode| {
        assert_eq!(opcode, -1);
        let n = m.pop();
        let (mut a, mut b) = (0 as Cell, 1 as Cell);
        for _ in 1..n {
            (a, b) = (b, a.wrapping_add(b));
        }
        m.push(b)?;
        m.set_pc(m.pc() + 1);
        Ok(())
    });
    i.run().unwrap();
    check("fib_opcode", &i, None, &[832_040], &[]);
}

#[test]
fn scenario_capability_query_reports_pushed_frame() {
    let img = assemble("caps", "-6 5 out 0 0 out wait 5 in").unwrap();
    let mut i = Instance::new(img, "");
    i.set_address_size(1024).unwrap();
    i.machine_mut().rpush(42).unwrap();
    i.run().unwrap();
    assert_eq!(i.machine().data(), &[1]);
    assert_eq!(i.machine().address(), &[42]);
}

#[test]
fn scenario_multiple_inputs_drain_in_order() {
    let src = "jump start .org 32
               :io dup 3 ! out 0 0 out wait 3 @ in ;
               :start :again 1 1 io jump again";
    let img = assemble("multi", src).unwrap();
    let mut i = Instance::new(img, "");
    i.push_input(std::io::Cursor::new(b"56".to_vec()));
    i.push_input(std::io::Cursor::new(b"34".to_vec()));
    i.push_input(std::io::Cursor::new(b"12".to_vec()));
    let err = i.run().unwrap_err();
    assert!(err.is_end_of_input(), "unexpected: {err}");
    let m = i.machine_mut();
    for expected in [b'6', b'5', b'4', b'3', b'2', b'1'] {
        assert_eq!(m.pop(), Cell::from(expected));
    }
}

#[test]
fn scenario_image_width_roundtrip() {
    let path = std::env::temp_dir().join(format!("ngaro_conformance_img_{}", std::process::id()));

    image::save(&path, &[-1], CellWidth::W32).unwrap();
    let (mem, cells) = image::load(&path, 0, CellWidth::W32).unwrap();
    assert_eq!(cells, 1);
    assert_eq!(mem[0], -1);

    if CELL_BITS == 32 {
        // Reinterpreting the same four bytes as half of a 64-bit cell
        // produces a value no 32-bit build can hold.
        std::fs::write(&path, [0xff, 0xff, 0xff, 0xff, 0x01, 0, 0, 0]).unwrap();
        let err = image::load(&path, 0, CellWidth::W64).unwrap_err();
        assert!(
            matches!(err, CodecError::ValueTooLarge { location: 0, .. }),
            "unexpected: {err}"
        );
    }
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn save_through_port_four_roundtrips() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("ngaro_conformance_save_{}", std::process::id()));
    let img = assemble("save", "1 4 out 0 0 out wait 4 in").unwrap();
    let expected = img.clone();
    let mut i = Instance::new(img, &path);
    i.run().unwrap();
    assert_eq!(i.machine().tos(), 0);

    let (saved, cells) = image::load(&path, 0, CellWidth::Native).unwrap();
    assert_eq!(cells, expected.len());
    assert_eq!(&saved[..cells], expected.as_slice());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn instruction_count_includes_loop_iterations() {
    let i = run_asm("count", "10 :0 loop 0-");
    assert_eq!(i.machine().instruction_count(), 11);
}

#[test]
fn disassembly_reassembles_identically() {
    let img = assemble("rt", FIB_RECURSIVE).unwrap();
    let text = ngaro_vm::disasm::disassemble_to_string(&img, 0);
    let back = assemble("rt_back", &text).unwrap();
    assert_eq!(back, img);
}

#[test]
fn stack_resize_is_rejected_below_depth() {
    let mut i = Instance::new(vec![], "");
    for n in 0..10 {
        i.machine_mut().push(n).unwrap();
    }
    assert!(i.set_data_size(9).is_err());
    i.set_data_size(10).unwrap();
    assert_eq!(i.machine().data().len(), 10);

    let mut i = Instance::new(vec![], "");
    for n in 0..10 {
        i.machine_mut().rpush(n).unwrap();
    }
    assert!(i.set_address_size(9).is_err());
    i.set_address_size(10).unwrap();
    assert_eq!(i.machine().address().len(), 10);
}

#[test]
fn fault_reports_pc_and_stack_sizes() {
    let img = assemble("bad_fetch", "16 @").unwrap();
    let mut i = Instance::new(img, "");
    let err = i.run().unwrap_err();
    assert_eq!(
        err.to_string(),
        "fault at pc=2/3, stack 1/1024, rstack 0/1024: memory index 16 out of range"
    );
}
