use keel::{
    Halted, Kernel,
    addressing::{PHYS_BASE, Va},
    config::SystemConfigurationBuilder,
};
use keel_userprog::{
    System,
    loader::{
        elf::{ElfBuilder, PFlags, PType},
        install_executable,
    },
    syscall::SyscallNumber,
    user::ProgramTable,
};
use std::sync::{Arc, Mutex};

fn boot_with(
    user_frames: usize,
    programs: ProgramTable,
    images: &[(&str, Vec<u8>)],
) -> (Arc<Kernel>, Arc<System>) {
    let kernel = Kernel::boot(
        SystemConfigurationBuilder::new()
            .quiet(true)
            .user_frames(user_frames)
            .build(),
    )
    .unwrap();
    for (name, image) in images {
        kernel.fs().install(name, image).unwrap();
    }
    let names: Vec<String> = programs.names().map(String::from).collect();
    for name in names {
        if !kernel.fs().exists(&name) {
            install_executable(kernel.fs(), &name).unwrap();
        }
    }
    let system = System::new(&kernel, programs);
    (kernel, system)
}

fn boot(programs: ProgramTable) -> (Arc<Kernel>, Arc<System>) {
    boot_with(64, programs, &[])
}

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn console(kernel: &Kernel) -> String {
    kernel.machine().console.output()
}

type Log = Arc<Mutex<Vec<i32>>>;

fn children() -> ProgramTable {
    ProgramTable::new()
        .register("child-simple", |_| 81)
        .register("child-code", |ctx| {
            ctx.args()
                .get(1)
                .and_then(|code| code.parse().ok())
                .unwrap_or(-2)
        })
        .register("child-args", |ctx| ctx.args().len() as i32)
}

#[test]
fn arguments_are_laid_out_on_the_stack() {
    let args = Arc::new(Mutex::new(Vec::new()));
    let seen = args.clone();
    let (kernel, system) = boot(ProgramTable::new().register("/bin/ls", move |ctx| {
        assert_eq!(ctx.esp(), va(0xbfff_ffcc));
        assert_eq!(ctx.load_u32(va(0xbfff_ffcc)), 0);
        assert_eq!(ctx.load_u32(va(0xbfff_ffd0)), 4);
        assert_eq!(ctx.load_u32(va(0xbfff_ffd4)), 0xbfff_ffd8);
        assert_eq!(ctx.load_u32(va(0xbfff_ffd8)), 0xbfff_ffed);
        assert_eq!(ctx.load_u32(va(0xbfff_ffe4)), 0xbfff_fffc);
        assert_eq!(ctx.load_u32(va(0xbfff_ffe8)), 0);
        *seen.lock().unwrap() = ctx.args();
        7
    }));
    let code = kernel
        .run(|| system.run_task("/bin/ls  -l foo   bar"))
        .unwrap();
    assert_eq!(code, 7);
    assert_eq!(*args.lock().unwrap(), ["/bin/ls", "-l", "foo", "bar"]);
    assert!(console(&kernel).contains("/bin/ls: exit(7)\n"));
}

#[test]
fn programs_are_loaded_lazily() {
    let (kernel, system) = boot(ProgramTable::new().register("lazy", |ctx| {
        // Text, two pages of data and bss, and the stack; only the stack is
        // resident.
        assert_eq!(ctx.mm().registered_pages(), 4);
        assert_eq!(ctx.mm().page_directory().mapped_pages(), 1);

        let mut byte = [0u8];
        ctx.load(va(0x0804_8000), &mut byte);
        assert_eq!(byte, [0xcc]);
        ctx.load(va(0x0804_a01f), &mut byte);
        assert_eq!(byte, [0x5a]);
        ctx.load(va(0x0804_a020), &mut byte);
        assert_eq!(byte, [0]);
        ctx.store_u32(va(0x0804_bffc), 0xdead_beef);
        assert_eq!(ctx.load_u32(va(0x0804_bffc)), 0xdead_beef);
        assert_eq!(ctx.mm().page_directory().mapped_pages(), 4);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("lazy")).unwrap(), 0);
    assert_eq!(system.vm().frames_in_use(), 0);
}

#[test]
fn exit_codes_reach_the_parent_once() {
    let log: Log = Arc::default();
    let seen = log.clone();
    let (kernel, system) = boot(children().register("parent", move |ctx| {
        let pid = ctx.exec("child-simple");
        let first = ctx.wait(pid);
        let second = ctx.wait(pid);
        seen.lock().unwrap().extend([first, second]);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("parent")).unwrap(), 0);
    assert_eq!(*log.lock().unwrap(), [81, -1]);
    let out = console(&kernel);
    assert!(out.contains("child-simple: exit(81)\n"));
    assert!(out.contains("parent: exit(0)\n"));
}

#[test]
fn children_are_waited_in_any_order() {
    let log: Log = Arc::default();
    let seen = log.clone();
    let (kernel, system) = boot(children().register("parent", move |ctx| {
        let pids: Vec<i32> = (1..=3).map(|n| ctx.exec(&format!("child-code {n}"))).collect();
        // The first child has long exited when it is waited for.
        ctx.spin(10);
        let codes: Vec<i32> = pids.iter().rev().map(|pid| ctx.wait(*pid)).collect();
        seen.lock().unwrap().extend(codes);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("parent")).unwrap(), 0);
    assert_eq!(*log.lock().unwrap(), [3, 2, 1]);
}

#[test]
fn children_can_be_left_behind() {
    let (kernel, system) = boot(children().register("parent", |ctx| {
        let pid = ctx.exec("child-simple");
        assert!(pid > 0);
        ctx.spin(10);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("parent")).unwrap(), 0);
    let out = console(&kernel);
    assert!(out.contains("child-simple: exit(81)\n"));
    assert!(out.contains("parent: exit(0)\n"));
}

#[test]
fn waiting_on_a_stranger_fails() {
    let log: Log = Arc::default();
    let seen = log.clone();
    let (kernel, system) = boot(ProgramTable::new().register("wait-bad", move |ctx| {
        let me = ctx.tid() as i32;
        let codes = [ctx.wait(12345), ctx.wait(me), ctx.wait(-1)];
        seen.lock().unwrap().extend(codes);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("wait-bad")).unwrap(), 0);
    assert_eq!(*log.lock().unwrap(), [-1, -1, -1]);
}

#[test]
fn exec_of_a_missing_program_fails() {
    let log: Log = Arc::default();
    let seen = log.clone();
    let (kernel, system) = boot(ProgramTable::new().register("exec-missing", move |ctx| {
        let pid = ctx.exec("no-such-file arg");
        seen.lock().unwrap().push(pid);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("exec-missing")).unwrap(), 0);
    assert_eq!(*log.lock().unwrap(), [-1]);
    let out = console(&kernel);
    assert!(out.contains("load: no-such-file: open failed\n"));
    assert!(out.contains("no-such-file: exit(-1)\n"));
}

#[test]
fn argument_lists_must_fit_on_the_stack() {
    let log: Log = Arc::default();
    let seen = log.clone();
    let (kernel, system) = boot(children().register("exec-args", move |ctx| {
        let many = format!("child-args{}", " x".repeat(1000));
        let some = format!("child-args{}", " x".repeat(100));
        let too_many = ctx.exec(&many);
        let pid = ctx.exec(&some);
        let argc = ctx.wait(pid);
        seen.lock().unwrap().extend([too_many, argc]);
        0
    }));
    assert_eq!(kernel.run(|| system.run_task("exec-args")).unwrap(), 0);
    assert_eq!(*log.lock().unwrap(), [-1, 101]);
    assert!(console(&kernel).contains("child-args: exit(-1)\n"));
}

#[test]
fn exit_syscall_sets_the_code() {
    let (kernel, system) = boot(ProgramTable::new().register("exit", |ctx| ctx.sys_exit(57)));
    assert_eq!(kernel.run(|| system.run_task("exit")).unwrap(), 57);
    assert!(console(&kernel).contains("exit: exit(57)\n"));
}

#[test]
fn programs_without_a_body_exit_normally() {
    let (kernel, system) = boot(ProgramTable::new());
    install_executable(kernel.fs(), "plain").unwrap();
    assert_eq!(kernel.run(|| system.run_task("plain")).unwrap(), 0);
}

#[test]
fn malformed_executables_do_not_load() {
    let images = [
        (
            "amd64",
            ElfBuilder::program()
                .with_header(|h| h.e_machine = 0x3e)
                .build(),
        ),
        (
            "dynamic",
            ElfBuilder::program().phdr(PType::Interp as u32).build(),
        ),
        (
            "kernel-seg",
            ElfBuilder::new(0x0804_8000)
                .segment(0xbfff_f000, vec![1; 16], 0x2000, PFlags::READ)
                .build(),
        ),
        (
            "page-zero",
            ElfBuilder::new(0x0804_8000)
                .segment(0, vec![1; 16], 0x1000, PFlags::READ)
                .build(),
        ),
        (
            "empty-seg",
            ElfBuilder::new(0x0804_8000)
                .segment(0x0804_8000, vec![], 0, PFlags::READ)
                .build(),
        ),
        ("short", b"\x7fELF".to_vec()),
    ];
    let (kernel, system) = boot_with(64, ProgramTable::new(), &images);
    kernel
        .run(|| {
            for (name, _) in &images {
                assert_eq!(system.run_task(name), -1, "{name} loaded");
            }
        })
        .unwrap();
    let out = console(&kernel);
    for (name, _) in &images {
        assert!(out.contains(&format!("{name}: exit(-1)\n")));
    }
    assert_eq!(system.vm().frames_in_use(), 0);
}

#[test]
fn unknown_segment_types_are_ignored() {
    let image = ElfBuilder::program()
        .phdr(PType::Note as u32)
        .phdr(0x7000_0000)
        .build();
    let (kernel, system) = boot_with(
        64,
        ProgramTable::new().register("notes", |_| 3),
        &[("notes", image)],
    );
    assert_eq!(kernel.run(|| system.run_task("notes")).unwrap(), 3);
}

#[test]
fn bad_syscall_numbers_kill() {
    let (kernel, system) = boot(
        ProgramTable::new()
            .register("sc-bad-num", |ctx| {
                ctx.push(&42u32.to_le_bytes());
                let esp = ctx.push(&42u32.to_le_bytes());
                ctx.trap(esp);
                0
            })
            .register("sc-bad-sp", |ctx| {
                ctx.trap(va(0x0400_0000));
                0
            })
            .register("sc-bad-arg", |ctx| {
                // The number is readable but the argument lies past the top of
                // user memory.
                let top = va(PHYS_BASE - 4);
                ctx.store_u32(top, SyscallNumber::Exit as u32);
                ctx.trap(top);
                0
            }),
    );
    kernel
        .run(|| {
            for name in ["sc-bad-num", "sc-bad-sp", "sc-bad-arg"] {
                assert_eq!(system.run_task(name), -1);
            }
        })
        .unwrap();
    let out = console(&kernel);
    assert!(out.contains("sc-bad-num: exit(-1)\n"));
    assert!(out.contains("sc-bad-sp: exit(-1)\n"));
    assert!(out.contains("sc-bad-arg: exit(-1)\n"));
}

#[test]
fn bad_memory_accesses_kill() {
    let (kernel, system) = boot(
        ProgramTable::new()
            .register("write-text", |ctx| {
                ctx.store(va(0x0804_8000), b"x");
                0
            })
            .register("read-null", |ctx| {
                ctx.load_u32(va(0));
                0
            })
            .register("read-kernel", |ctx| {
                ctx.load_u32(va(PHYS_BASE));
                0
            })
            .register("stack-below", |ctx| {
                // Only one stack page exists.
                ctx.load_u32(va(PHYS_BASE - 0x2000));
                0
            }),
    );
    kernel
        .run(|| {
            for name in ["write-text", "read-null", "read-kernel", "stack-below"] {
                assert_eq!(system.run_task(name), -1, "{name} survived");
            }
        })
        .unwrap();
    assert_eq!(system.vm().frames_in_use(), 0);
}

#[test]
fn halt_powers_off() {
    let (kernel, system) = boot(ProgramTable::new().register("halt", |ctx| ctx.halt()));
    assert_eq!(
        kernel.run(|| system.run_task("halt")),
        Err(Halted::PowerOff)
    );
}

#[test]
fn process_memory_is_swapped() {
    let image = ElfBuilder::new(0x0804_8000)
        .segment(0x0804_8000, vec![0xcc; 16], 16, PFlags::READ | PFlags::EXECUTABLE)
        .segment(0x1000_0000, vec![], 0x1_0000, PFlags::READ | PFlags::WRITE)
        .build();
    let (kernel, system) = boot_with(
        6,
        ProgramTable::new().register("big", |ctx| {
            for page in 0..16u32 {
                ctx.store_u32(va(0x1000_0000 + page as usize * 0x1000), page * 3 + 1);
            }
            for page in 0..16u32 {
                let v = ctx.load_u32(va(0x1000_0000 + page as usize * 0x1000));
                if v != page * 3 + 1 {
                    return 1;
                }
            }
            0
        }),
        &[("big", image)],
    );
    let free = system.vm().swap().free_slots();
    assert_eq!(kernel.run(|| system.run_task("big")).unwrap(), 0);
    assert_eq!(system.vm().frames_in_use(), 0);
    assert_eq!(system.vm().swap().free_slots(), free);
}
