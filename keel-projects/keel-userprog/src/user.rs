//! User programs.
//!
//! A program's machine code is never executed. Its executable is still a real
//! image that is loaded lazily like any other, but its behavior is a Rust
//! function, registered under the executable's name in a [`ProgramTable`],
//! that drives the process through a [`UserContext`]: every memory access
//! the function makes goes through the process's page directory, faulting
//! pages in on the way, and every system call is made by pushing a frame on
//! the user stack and trapping into the kernel.
//!
//! A program that touches memory it may not access is killed with `-1`,
//! exactly as the page fault handler would kill a real one.

use crate::{
    process::Process,
    syscall::{Registers, SyscallNumber},
    uaccess::{UserCString, UserPtrRO},
};
use keel::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    thread::Tid,
    timer,
};
use keel_vm::MmStruct;
use std::{collections::BTreeMap, sync::Arc};

/// The behavior of a program. Its return value is the exit code.
pub type ProgramBody = Arc<dyn Fn(&mut UserContext) -> i32 + Send + Sync>;

/// Programs by executable name.
///
/// An executable with no registered body exits with `0` as soon as it is
/// loaded.
#[derive(Clone, Default)]
pub struct ProgramTable {
    bodies: BTreeMap<String, ProgramBody>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `body` for the executable `name`.
    pub fn register(
        mut self,
        name: &str,
        body: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.bodies.insert(name.to_string(), Arc::new(body));
        self
    }

    pub fn get(&self, name: &str) -> Option<ProgramBody> {
        self.bodies.get(name).cloned()
    }

    /// Names of the registered programs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bodies.keys().map(String::as_str)
    }
}

/// The view a running program has of its process.
pub struct UserContext {
    process: Process,
    regs: Registers,
    /// Stack pointer at startup, where `argc` and `argv` can be found.
    initial_sp: Va,
}

impl UserContext {
    pub(crate) fn new(process: Process, regs: Registers) -> Self {
        Self {
            process,
            initial_sp: regs.esp,
            regs,
        }
    }

    pub fn name(&self) -> &str {
        self.process.name()
    }

    pub fn tid(&self) -> Tid {
        self.process.tid()
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    /// The address space of the process.
    pub fn mm(&self) -> &MmStruct {
        self.process.mm()
    }

    pub fn process(&mut self) -> &mut Process {
        &mut self.process
    }

    pub fn esp(&self) -> Va {
        self.regs.esp
    }

    pub fn set_esp(&mut self, esp: Va) {
        self.regs.esp = esp;
    }

    /// Terminates the process with `code`.
    pub fn exit(&mut self, code: i32) -> ! {
        self.process.exit(code)
    }

    fn kill(&mut self, addr: Va, e: KernelError) -> ! {
        log::debug!("{}: {e:?} accessing {addr:?}", self.process.name());
        self.process.exit(-1)
    }

    /// Reads user memory at `addr` into `buf`.
    pub fn load(&mut self, addr: Va, buf: &mut [u8]) {
        if let Err(e) = self.process.mm().read_user(addr, buf) {
            self.kill(addr, e)
        }
    }

    /// Writes `data` to user memory at `addr`.
    pub fn store(&mut self, addr: Va, data: &[u8]) {
        if let Err(e) = self.process.mm().write_user(addr, data) {
            self.kill(addr, e)
        }
    }

    pub fn load_u32(&mut self, addr: Va) -> u32 {
        match UserPtrRO::<u32>::new(addr).get(self.process.mm()) {
            Ok(v) => v,
            Err(e) => self.kill(addr, e),
        }
    }

    pub fn store_u32(&mut self, addr: Va, v: u32) {
        self.store(addr, &v.to_le_bytes())
    }

    /// Pushes `data` on the user stack and returns its address.
    pub fn push(&mut self, data: &[u8]) -> Va {
        let Some(sp) = self.regs.esp.into_usize().checked_sub(data.len()) else {
            self.kill(self.regs.esp, KernelError::BadAddress)
        };
        let sp = Va::new(sp).unwrap_or(Va::NULL);
        self.store(sp, data);
        self.regs.esp = sp;
        sp
    }

    /// Pushes `s` as a NUL-terminated string and returns its address.
    pub fn push_str(&mut self, s: &str) -> Va {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push(&bytes)
    }

    /// Reads the NUL-terminated string at `addr`.
    pub fn load_str(&mut self, addr: Va) -> String {
        match UserCString::new(addr).read(self.process.mm(), PAGE_SIZE) {
            Ok(s) => s,
            Err(e) => self.kill(addr, e),
        }
    }

    /// The arguments the program was started with, read from its stack.
    pub fn args(&mut self) -> Vec<String> {
        let argc = self.load_u32(self.initial_sp + 4) as usize;
        let argv = Va::new(self.load_u32(self.initial_sp + 8) as usize).unwrap_or(Va::NULL);
        (0..argc)
            .map(|i| {
                let arg = Va::new(self.load_u32(argv + 4 * i) as usize).unwrap_or(Va::NULL);
                self.load_str(arg)
            })
            .collect()
    }

    /// Busy-waits for `ticks` timer ticks, accounted as user time.
    pub fn spin(&mut self, ticks: u64) {
        timer::spin(ticks)
    }

    /// Traps into the kernel with the system call frame at `esp`, and
    /// returns `eax`.
    pub fn trap(&mut self, esp: Va) -> i32 {
        let mut regs = Registers { esp, ..self.regs };
        self.process.syscall(&mut regs);
        self.regs.eax = regs.eax;
        regs.eax as i32
    }

    /// Makes system call `no` with `args`, pushing its frame on the stack.
    pub fn syscall(&mut self, no: SyscallNumber, args: &[u32]) -> i32 {
        let saved = self.regs.esp;
        for arg in args.iter().rev() {
            self.push(&arg.to_le_bytes());
        }
        let frame = self.push(&(no as u32).to_le_bytes());
        let r = self.trap(frame);
        self.regs.esp = saved;
        r
    }

    /// Makes system call `no` with a string as its first argument.
    fn syscall_str(&mut self, no: SyscallNumber, s: &str, rest: &[u32]) -> i32 {
        let saved = self.regs.esp;
        let ptr = self.push_str(s).into_usize() as u32;
        let mut args = vec![ptr];
        args.extend_from_slice(rest);
        let r = self.syscall(no, &args);
        self.regs.esp = saved;
        r
    }

    pub fn halt(&mut self) -> ! {
        self.syscall(SyscallNumber::Halt, &[]);
        unreachable!("halt returned")
    }

    pub fn sys_exit(&mut self, code: i32) -> ! {
        self.syscall(SyscallNumber::Exit, &[code as u32]);
        unreachable!("exit returned")
    }

    pub fn exec(&mut self, cmdline: &str) -> i32 {
        self.syscall_str(SyscallNumber::Exec, cmdline, &[])
    }

    pub fn wait(&mut self, pid: i32) -> i32 {
        self.syscall(SyscallNumber::Wait, &[pid as u32])
    }

    pub fn create(&mut self, name: &str, size: u32) -> bool {
        self.syscall_str(SyscallNumber::Create, name, &[size]) == 1
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.syscall_str(SyscallNumber::Remove, name, &[]) == 1
    }

    pub fn open(&mut self, name: &str) -> i32 {
        self.syscall_str(SyscallNumber::Open, name, &[])
    }

    pub fn filesize(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Filesize, &[fd as u32])
    }

    /// Reads from `fd` into the user buffer at `buf`.
    pub fn read(&mut self, fd: i32, buf: Va, len: u32) -> i32 {
        self.syscall(SyscallNumber::Read, &[fd as u32, buf.into_usize() as u32, len])
    }

    /// Writes the user buffer at `buf` to `fd`.
    pub fn write(&mut self, fd: i32, buf: Va, len: u32) -> i32 {
        self.syscall(SyscallNumber::Write, &[fd as u32, buf.into_usize() as u32, len])
    }

    /// Writes `data` to `fd` through a copy on the user stack.
    pub fn write_bytes(&mut self, fd: i32, data: &[u8]) -> i32 {
        let saved = self.regs.esp;
        let buf = self.push(data);
        let r = self.write(fd, buf, data.len() as u32);
        self.regs.esp = saved;
        r
    }

    pub fn seek(&mut self, fd: i32, pos: u32) {
        self.syscall(SyscallNumber::Seek, &[fd as u32, pos]);
    }

    pub fn tell(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Tell, &[fd as u32])
    }

    pub fn close(&mut self, fd: i32) {
        self.syscall(SyscallNumber::Close, &[fd as u32]);
    }

    pub fn mmap(&mut self, fd: i32, addr: Va) -> i32 {
        self.syscall(SyscallNumber::Mmap, &[fd as u32, addr.into_usize() as u32])
    }

    pub fn munmap(&mut self, id: i32) {
        self.syscall(SyscallNumber::Munmap, &[id as u32]);
    }
}
