//! Processes: a kernel thread running a user program.
//!
//! ## Lifecycle
//!
//! [`spawn`] starts a thread for the new process and blocks until the thread
//! reports whether the program loaded. A process that fails to load exits
//! with `-1` right away and its parent gets an error instead of a tid.
//!
//! A loaded process runs its program, which ends by returning an exit code,
//! by calling `exit`, or by being killed with `-1` when it misbehaves. In
//! every case [`Process::exit`] prints `<name>: exit(<code>)`, gives back
//! every resource the process holds and publishes the code through the
//! process's [`ExitStatus`].
//!
//! A parent can wait once for each of its children. Children that are never
//! waited for are simply forgotten when the parent exits.

use crate::{
    System,
    exit_status::ExitStatus,
    file_struct::FileStruct,
    loader::LoadContext,
    syscall::{Registers, SyscallAbi, SyscallNumber, is_fatal},
    uaccess::{UserCString, UserU8SliceRO, UserU8SliceWO},
    user::UserContext,
};
use keel::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::File,
    kernel, kprintln,
    thread::{Current, ThreadBuilder, Tid},
};
use keel_vm::MmStruct;
use std::{collections::BTreeMap, sync::Arc};

/// Starts a process running `cmdline` and waits until it has loaded.
///
/// The first word of `cmdline` names the executable; all words, that one
/// included, become the program's arguments. Returns the tid of the new
/// process with the parent's handle on its exit status.
///
/// # Errors
/// - [`KernelError::InvalidArgument`] for an empty command line.
/// - [`KernelError::NoExec`] if the program did not load.
pub fn spawn(system: &Arc<System>, cmdline: &str) -> Result<(Tid, ExitStatus), KernelError> {
    let name = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument)?
        .to_string();
    let (parent, child) = ExitStatus::pair();
    let handle = {
        let system = system.clone();
        let cmdline = cmdline.to_string();
        ThreadBuilder::new(name.clone()).spawn(move || start_process(system, cmdline, child))?
    };
    if parent.wait_loaded() {
        log::debug!("process: {name} started as {}", handle.tid);
        Ok((handle.tid, parent))
    } else {
        parent.release();
        Err(KernelError::NoExec)
    }
}

fn start_process(system: Arc<System>, cmdline: String, status: ExitStatus) {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let mut process = Process {
        system,
        name: args.first().map(|s| s.to_string()).unwrap_or_default(),
        tid: Current::get_tid(),
        mm: None,
        files: FileStruct::new(),
        executable: None,
        status: Some(status),
        children: BTreeMap::new(),
    };
    match process.load(&args) {
        Ok(regs) => {
            process.report_load(true);
            process.run(regs)
        }
        Err(e) => {
            log::debug!("process: loading {} failed: {e:?}", process.name);
            process.report_load(false);
            process.exit(-1)
        }
    }
}

/// The state of a running process.
pub struct Process {
    system: Arc<System>,
    name: String,
    tid: Tid,
    mm: Option<MmStruct>,
    pub files: FileStruct,
    /// The running executable, denied writes while the process lives.
    executable: Option<File>,
    status: Option<ExitStatus>,
    /// Exit statuses of the children not waited for yet.
    children: BTreeMap<Tid, ExitStatus>,
}

impl Process {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// The address space of the process.
    pub fn mm(&self) -> &MmStruct {
        match &self.mm {
            Some(mm) => mm,
            None => panic!("Process {} has no address space.", self.name),
        }
    }

    fn mm_mut(&mut self) -> &mut MmStruct {
        match &mut self.mm {
            Some(mm) => mm,
            None => panic!("Process {} has no address space.", self.name),
        }
    }

    /// Builds the address space from the executable named by `args[0]`.
    fn load(&mut self, args: &[&str]) -> Result<Registers, KernelError> {
        let kernel = kernel();
        let mut exe = match kernel.fs().open(&self.name) {
            Ok(exe) => exe,
            Err(e) => {
                kprintln!("load: {}: open failed", self.name);
                return Err(e);
            }
        };
        let image = Arc::new(exe.reopen());
        let LoadContext { mm_struct, regs } =
            LoadContext::load(MmStruct::new(self.system.vm().clone()), &image, args)?;
        exe.deny_write();
        self.executable = Some(exe);
        Current::set_page_directory(Some(mm_struct.page_directory().clone()));
        self.mm = Some(mm_struct);
        Ok(regs)
    }

    fn report_load(&self, loaded: bool) {
        if let Some(status) = &self.status {
            status.set_loaded(loaded);
        }
    }

    /// Runs the program, then exits with the code it returns.
    fn run(self, regs: Registers) -> ! {
        let body = self.system.programs().get(&self.name);
        let mut ctx = UserContext::new(self, regs);
        let code = match body {
            Some(body) => body(&mut ctx),
            None => 0,
        };
        ctx.exit(code)
    }

    /// Starts a child process running `cmdline`.
    pub fn execute(&mut self, cmdline: &str) -> Result<Tid, KernelError> {
        let (tid, status) = spawn(&self.system, cmdline)?;
        self.children.insert(tid, status);
        Ok(tid)
    }

    /// Waits for the child `tid` to exit and returns its exit code.
    ///
    /// Returns `-1` if `tid` is not a child of this process, or if it has
    /// already been waited for.
    pub fn wait(&mut self, tid: Tid) -> i32 {
        match self.children.remove(&tid) {
            Some(status) => status.wait(),
            None => -1,
        }
    }

    /// Terminates the process with `code`.
    ///
    /// Everything the process holds is released here, before the thread
    /// exits: open files, memory mappings and the address space, the write
    /// denial on the executable, and its references to exit statuses.
    pub fn exit(&mut self, code: i32) -> ! {
        kprintln!("{}: exit({})", self.name, code);
        for (_, child) in std::mem::take(&mut self.children) {
            child.release();
        }
        self.files.close_all();
        if let Some(mm) = self.mm.take() {
            Current::set_page_directory(None);
            mm.destroy();
        }
        if let Some(exe) = self.executable.take() {
            exe.close();
        }
        if let Some(status) = self.status.take() {
            status.exit(code);
        }
        Current::exit()
    }

    /// Handles the system call whose frame starts at `regs.esp`, leaving its
    /// result in `regs.eax`.
    ///
    /// A call that fails with a fatal error kills the process with `-1`;
    /// any other failure returns `-1` to the program.
    pub fn syscall(&mut self, regs: &mut Registers) {
        regs.eax = match self.dispatch(regs.esp) {
            Ok(v) => v,
            Err(e) if is_fatal(e) => {
                log::debug!("process: {} killed by {e:?} in a system call", self.name);
                self.exit(-1)
            }
            Err(_) => u32::MAX,
        };
    }

    fn dispatch(&mut self, esp: Va) -> Result<u32, KernelError> {
        let abi = SyscallAbi::from_stack(self.mm(), esp)?;
        match abi.number()? {
            SyscallNumber::Halt => kernel().power_off(),
            SyscallNumber::Exit => {
                let code = abi.arg_i32(0)?;
                self.exit(code)
            }
            SyscallNumber::Exec => {
                let cmdline = UserCString::new(abi.arg_va(0)?).read(self.mm(), PAGE_SIZE)?;
                self.execute(&cmdline).map(|tid| tid as u32)
            }
            SyscallNumber::Wait => {
                let tid = abi.arg(0)? as Tid;
                Ok(self.wait(tid) as u32)
            }
            SyscallNumber::Create => {
                let (name, size) = (abi.arg_va(0)?, abi.arg(1)? as usize);
                let name = UserCString::new(name).read(self.mm(), PAGE_SIZE)?;
                Ok(kernel().fs().create(&name, size).is_ok() as u32)
            }
            SyscallNumber::Remove => {
                let name = UserCString::new(abi.arg_va(0)?).read(self.mm(), PAGE_SIZE)?;
                Ok(kernel().fs().remove(&name).is_ok() as u32)
            }
            SyscallNumber::Open => {
                let name = UserCString::new(abi.arg_va(0)?).read(self.mm(), PAGE_SIZE)?;
                self.files.open(&name).map(|fd| fd as u32)
            }
            SyscallNumber::Filesize => {
                let fd = abi.arg_i32(0)?;
                self.files.filesize(fd).map(|len| len as u32)
            }
            SyscallNumber::Read => {
                let (fd, buf, len) = (abi.arg_i32(0)?, abi.arg_va(1)?, abi.arg(2)? as usize);
                self.files.get(fd)?;
                let out = UserU8SliceWO::new(buf, len);
                if out.is_empty() {
                    return Ok(0);
                }
                out.check(self.mm())?;
                let mut data = vec![0; len];
                let read = self.files.read(fd, &mut data)?;
                out.put(self.mm(), &data[..read]).map(|n| n as u32)
            }
            SyscallNumber::Write => {
                let (fd, buf, len) = (abi.arg_i32(0)?, abi.arg_va(1)?, abi.arg(2)? as usize);
                self.files.get(fd)?;
                if len == 0 {
                    return Ok(0);
                }
                let data = UserU8SliceRO::new(buf, len).get(self.mm())?;
                self.files.write(fd, &data).map(|n| n as u32)
            }
            SyscallNumber::Seek => {
                let (fd, pos) = (abi.arg_i32(0)?, abi.arg(1)? as usize);
                self.files.seek(fd, pos).map(|_| 0)
            }
            SyscallNumber::Tell => {
                let fd = abi.arg_i32(0)?;
                self.files.tell(fd).map(|pos| pos as u32)
            }
            SyscallNumber::Close => {
                let fd = abi.arg_i32(0)?;
                self.files.close(fd).map(|_| 0)
            }
            SyscallNumber::Mmap => {
                let (fd, addr) = (abi.arg_i32(0)?, abi.arg_va(1)?);
                let file = self
                    .files
                    .reopen(fd)
                    .map_err(|_| KernelError::InvalidArgument)?;
                self.mm_mut().mmap(file, addr).map(|id| id as u32)
            }
            SyscallNumber::Munmap => {
                let id = abi.arg(0)? as usize;
                self.mm_mut().munmap(id).map(|_| 0)
            }
        }
    }
}
