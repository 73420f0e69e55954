/*
 * Thread Control Blocks
 *
 * Every thread owns one kernel stack page with its TCB at the top, so the
 * block and the stack are reachable from one pointer. The TCB table is a
 * flat array of pointers indexed by tid & (N-1); ids are handed out by a
 * rotating linear scan and never reused while the block lives.
 *
 * A thread whose tid equals its rid is a process (root) thread and owns the
 * process's user address space. Process lifetime is reference counted: each
 * member thread and each thread visiting over RPC holds one reference, and
 * a killed process lingers as a zombie until the count drains.
 */

use core::ptr::{self, NonNull};

use super::{CpuId, MAX_CPUS, Tid};
use crate::caps::CapSet;
use crate::config;
use crate::memory::address_space::{self, Uvmem};
use crate::memory::paging::Vmem;
use crate::memory::region::Mm;
use crate::memory::{
    BASE_PAGE, BASE_PAGE_SIZE, PhysAddr, VirtAddr, VmFlags, align_down, physmap,
};
use crate::thread::notify::NotifyFlags;
use crate::thread::rpc;

/// Saved integer register file, in RISC-V order. Lives immediately below
/// the address in `tcb.regs`, either under the TCB on the kernel stack page
/// or under a CallCtx on the RPC stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

impl Regs {
    /// Write the syscall return/argument registers a0..a5.
    pub fn set_args(&mut self, vals: &[usize]) {
        let slots = [
            &mut self.a0,
            &mut self.a1,
            &mut self.a2,
            &mut self.a3,
            &mut self.a4,
            &mut self.a5,
        ];
        for (slot, val) in slots.into_iter().zip(vals) {
            *slot = *val;
        }
    }

    /// Read back a0..a5.
    pub fn args(&self) -> [usize; 6] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5]
    }
}

/// Lifecycle of a process (root) thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    /// Killed, waiting for the last reference to drain.
    Zombie,
    /// Fully torn down; the slot is free again.
    Dead,
}

/// The (eid, pid) part of a thread's identity and its transitions across
/// the IPC flavors. rid and tid never change, so they stay plain fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Effective process id: where globally visible work (such as memory
    /// allocation) lands.
    pub eid: Tid,
    /// The process the thread currently executes in.
    pub pid: Tid,
}

impl Identity {
    /// Plain request: both ids move to the target.
    pub fn on_req(self, target_rid: Tid) -> Identity {
        Identity {
            eid: target_rid,
            pid: target_rid,
        }
    }

    /// Forward: the effective id is preserved so the target can keep
    /// working on the original caller's behalf.
    pub fn on_fwd(self, target_rid: Tid) -> Identity {
        Identity {
            eid: self.eid,
            pid: target_rid,
        }
    }

    /// Tail call: same identity move as a request, but the caller's frame
    /// is reused.
    pub fn on_tail(self, target_rid: Tid) -> Identity {
        self.on_req(target_rid)
    }

    /// Kick: forward semantics on a reused frame.
    pub fn on_kick(self, target_rid: Tid) -> Identity {
        self.on_fwd(target_rid)
    }

    /// Response: whatever the popped frame saved.
    pub fn on_resp(self, saved: Identity) -> Identity {
        saved
    }
}

/// Thread control block.
#[repr(C)]
pub struct Tcb {
    /// Userspace PC to resume at.
    pub exec: VirtAddr,
    /// Top of the register save area the next trap return restores from.
    pub regs: VirtAddr,

    /// User memory of the process. Owned only when `uvmem.owner == tid`;
    /// other member threads keep the root's id there and go through the
    /// table.
    pub uvmem: Uvmem,
    /// Page table of the process the thread belongs to.
    pub proc_vmem: Vmem,
    /// The thread's private overlay table used while visiting other
    /// processes over RPC.
    pub rpc_vmem: Vmem,

    /// Entry point other threads migrate to when they RPC into this
    /// process. Unset (NULL) until ipc_server registers one.
    pub callback: VirtAddr,
    /// Userspace stack.
    pub thread_stack: VirtAddr,
    pub thread_stack_size: usize,
    /// Bottom of the currently used RPC stack frame; the empty sentinel is
    /// the top of the RPC window.
    pub rpc_stack: VirtAddr,

    /// References held on this process thread (membership + visitors).
    /// Meaningful only when tid == rid.
    pub refcount: usize,

    pub eid: Tid,
    pub pid: Tid,
    /// Root process id: the process that spawned this thread, its home.
    pub rid: Tid,
    pub tid: Tid,
    pub cpu_id: CpuId,

    /// Thread handling notifications directed at this one.
    pub notify_id: Tid,
    pub notify_flags: NotifyFlags,
    pub caps: CapSet,
    pub state: ProcState,
    pub orphaned: bool,
}

impl Tcb {
    /// Process thread: root of a live process.
    pub fn is_proc(&self) -> bool {
        self.tid == self.rid && !self.orphaned
    }

    /// Thread currently has RPC frames.
    pub fn is_rpc(&self) -> bool {
        !rpc::stack_empty(self.rpc_stack)
    }

    /// Dead or dying.
    pub fn zombie(&self) -> bool {
        self.state != ProcState::Alive
    }

    pub fn identity(&self) -> Identity {
        Identity {
            eid: self.eid,
            pid: self.pid,
        }
    }

    pub fn set_identity(&mut self, id: Identity) {
        self.eid = id.eid;
        self.pid = id.pid;
    }

    /// The page table the thread actually runs on: its private RPC overlay
    /// while visiting, the process table at home.
    pub fn active_vmem(&self) -> Vmem {
        if self.is_rpc() {
            self.rpc_vmem
        } else {
            self.proc_vmem
        }
    }
}

/// Flat table of TCB pointers plus the rotating id cursor.
pub struct TcbTable {
    slots: *mut *mut Tcb,
    num: usize,
    next_tid: Tid,
    table_page: PhysAddr,
}

// Only touched under the big kernel lock.
unsafe impl Send for TcbTable {}

/// Order of the page backing the TCB pointer table (2 MiB on Sv39).
const TCB_TABLE_ORDER: usize = 1;

impl TcbTable {
    pub fn new(mm: &mut Mm) -> Option<TcbTable> {
        let page = mm.pmem.alloc_page(TCB_TABLE_ORDER)?;
        let size = crate::memory::order_size(TCB_TABLE_ORDER);
        unsafe { physmap::phys_zero(page, size) };

        let num = size / size_of::<*mut Tcb>();
        assert!(num.is_power_of_two());

        Some(TcbTable {
            slots: unsafe { physmap::phys_ptr::<*mut Tcb>(page) },
            num,
            next_tid: 1,
            table_page: page,
        })
    }

    pub fn destroy(&mut self, mm: &mut Mm) {
        mm.pmem.free_page(TCB_TABLE_ORDER, self.table_page);
        self.slots = ptr::null_mut();
        self.num = 0;
    }

    /// Maximum number of simultaneously live threads.
    pub fn capacity(&self) -> usize {
        self.num
    }

    fn slot(&self, tid: Tid) -> *mut *mut Tcb {
        unsafe { self.slots.add(tid & (self.num - 1)) }
    }

    /// Look up a live TCB. Returns zombies too; callers decide whether a
    /// zombie is acceptable.
    pub fn get(&self, tid: Tid) -> Option<NonNull<Tcb>> {
        if tid == 0 || self.slots.is_null() {
            return None;
        }

        let p = unsafe { *self.slot(tid) };
        if p.is_null() {
            return None;
        }

        // masked collision: a different id occupies the slot
        if unsafe { (*p).tid } != tid {
            return None;
        }

        NonNull::new(p)
    }

    /// Allocate an id for a new block: linear scan from the cursor with
    /// explicit wrap-around; a full scan without a hole fails.
    fn alloc_tid(&mut self, t: *mut Tcb) -> Option<Tid> {
        let mut tid = self.next_tid;
        for _ in 0..=self.num {
            if tid == 0 {
                tid = 1;
            }

            let slot = self.slot(tid);
            if unsafe { *slot }.is_null() {
                unsafe { *slot = t };
                self.next_tid = tid + 1;
                return Some(tid);
            }

            tid += 1;
        }

        None
    }

    fn clear(&self, tid: Tid) {
        unsafe { *self.slot(tid) = ptr::null_mut() };
    }
}

/// Per-CPU execution state.
pub struct Cpus {
    current: [*mut Tcb; MAX_CPUS],
    pub pending_ipi: [bool; MAX_CPUS],
}

unsafe impl Send for Cpus {}

impl Cpus {
    pub const fn new() -> Cpus {
        Cpus {
            current: [ptr::null_mut(); MAX_CPUS],
            pending_ipi: [false; MAX_CPUS],
        }
    }

    pub fn current(&self, cpu: CpuId) -> Option<NonNull<Tcb>> {
        NonNull::new(self.current[cpu])
    }

    pub fn set_current(&mut self, cpu: CpuId, t: *mut Tcb) {
        self.current[cpu] = t;
    }

    /// Whether the thread is the current one of the CPU it last ran on.
    pub fn running(&self, t: &Tcb) -> bool {
        self.current[t.cpu_id] == t as *const Tcb as *mut Tcb
    }
}

impl Default for Cpus {
    fn default() -> Self {
        Cpus::new()
    }
}

/// Bump a process thread's reference count.
pub fn reference_proc(p: NonNull<Tcb>) {
    unsafe { (*p.as_ptr()).refcount += 1 };
}

/// Drop one reference; the last one out of a zombie tears the block down.
pub fn unreference_proc(mm: &mut Mm, tcbs: &TcbTable, p: NonNull<Tcb>) {
    let p = p.as_ptr();
    unsafe {
        (*p).refcount -= 1;
        if (*p).state != ProcState::Zombie || (*p).refcount != 0 {
            return;
        }

        log::debug!("process {} is completely destroyed", (*p).tid);
        (*p).state = ProcState::Dead;
        tcbs.clear((*p).tid);
        destroy_tcb_memory(mm, p);
    }
}

/// Free a block's RPC stack pages and table, then its kernel stack page
/// (which contains the block itself; nothing may touch it afterwards).
unsafe fn destroy_tcb_memory(mm: &mut Mm, t: *mut Tcb) {
    unsafe {
        if !(*t).rpc_vmem.is_null() {
            let rpc_vmem = (*t).rpc_vmem;

            // frame pages form one contiguous run down from the window top
            let layout = config::layout();
            let mut va = layout.rpc_stack_top.sub(BASE_PAGE_SIZE);
            while let Ok((pa, _, _)) = rpc_vmem.stat_vpage(va) {
                rpc_vmem.unmap_vpage(&mut mm.pmem, va);
                mm.pmem.free_page(BASE_PAGE, pa);

                if va <= layout.rpc_stack_base {
                    break;
                }
                va = va.sub(BASE_PAGE_SIZE);
            }

            rpc_vmem.destroy(&mut mm.pmem);
        }

        let bottom = align_down(t as usize, BASE_PAGE_SIZE);
        let page = physmap::virt_to_phys(VirtAddr::new(bottom));
        mm.pmem.free_page(BASE_PAGE, page);
    }
}

/// Flags of the first mapped RPC stack page.
fn rpc_stack_flags() -> VmFlags {
    VmFlags::VALID | VmFlags::READ | VmFlags::WRITE | VmFlags::USER
}

/// Create a thread. With a parent the thread joins the parent's process;
/// without one it becomes the root of a brand-new process with a fresh
/// address space.
pub fn create_thread(
    mm: &mut Mm,
    tcbs: &mut TcbTable,
    parent: Option<NonNull<Tcb>>,
) -> Option<NonNull<Tcb>> {
    let stack_page = mm.pmem.alloc_page(BASE_PAGE)?;
    unsafe { physmap::phys_zero(stack_page, BASE_PAGE_SIZE) };

    // the block sits at the top of its kernel stack page
    let page_va = physmap::phys_to_virt(stack_page).as_usize();
    let tcb_va = align_down(page_va + BASE_PAGE_SIZE - size_of::<Tcb>(), 16);
    let t = tcb_va as *mut Tcb;

    unsafe {
        t.write(Tcb {
            exec: VirtAddr::zero(),
            regs: VirtAddr::new(tcb_va),
            uvmem: Uvmem::empty(),
            proc_vmem: Vmem::null(),
            rpc_vmem: Vmem::null(),
            callback: VirtAddr::zero(),
            thread_stack: VirtAddr::zero(),
            thread_stack_size: 0,
            rpc_stack: config::layout().rpc_stack_top,
            refcount: 0,
            eid: 0,
            pid: 0,
            rid: 0,
            tid: 0,
            cpu_id: 0,
            notify_id: 0,
            notify_flags: NotifyFlags::empty(),
            caps: CapSet::empty(),
            state: ProcState::Alive,
            orphaned: false,
        });

        let Some(tid) = tcbs.alloc_tid(t) else {
            mm.pmem.free_page(BASE_PAGE, stack_page);
            return None;
        };
        (*t).tid = tid;

        if let Some(p) = parent {
            let p = p.as_ptr();
            (*t).pid = (*p).pid;
            (*t).rid = (*p).rid;
            (*t).notify_id = (*p).notify_id;
            (*t).caps = (*p).caps;
            // member threads share the process page table
            (*t).proc_vmem = (*p).proc_vmem;
            (*t).uvmem.owner = (*p).rid;
        } else {
            let Some(vmem) = Vmem::create(&mut mm.pmem) else {
                tcbs.clear(tid);
                mm.pmem.free_page(BASE_PAGE, stack_page);
                return None;
            };
            (*t).proc_vmem = vmem;
            (*t).pid = tid;
            (*t).rid = tid;
            (*t).notify_id = tid;
            if address_space::init_uvmem(mm, &mut (*t).uvmem, tid, vmem).is_err() {
                vmem.destroy(&mut mm.pmem);
                tcbs.clear(tid);
                mm.pmem.free_page(BASE_PAGE, stack_page);
                return None;
            }
        }

        (*t).eid = (*t).pid;

        let Some(rpc_vmem) = Vmem::create(&mut mm.pmem) else {
            tcbs.clear(tid);
            mm.pmem.free_page(BASE_PAGE, stack_page);
            return None;
        };
        (*t).rpc_vmem = rpc_vmem;

        // first RPC frame page, mapped up front so migration never faults
        let layout = config::layout();
        let first_frame = layout.rpc_stack_top.sub(BASE_PAGE_SIZE);
        let Some(frame_page) = mm.pmem.alloc_page(BASE_PAGE) else {
            rpc_vmem.destroy(&mut mm.pmem);
            tcbs.clear(tid);
            mm.pmem.free_page(BASE_PAGE, stack_page);
            return None;
        };
        let res = rpc_vmem.map_vpage(
            &mut mm.pmem,
            frame_page,
            first_frame,
            rpc_stack_flags(),
            BASE_PAGE,
        );
        if res.is_err() {
            mm.pmem.free_page(BASE_PAGE, frame_page);
            rpc_vmem.destroy(&mut mm.pmem);
            tcbs.clear(tid);
            mm.pmem.free_page(BASE_PAGE, stack_page);
            return None;
        }

        if let Some(root) = tcbs.get((*t).rid) {
            reference_proc(root);
        }

        NonNull::new(t)
    }
}

/// Create a process: a root thread, plus a copy of the parent when one is
/// given (fork).
pub fn create_proc(
    mm: &mut Mm,
    tcbs: &mut TcbTable,
    parent: Option<NonNull<Tcb>>,
) -> Option<NonNull<Tcb>> {
    let n = create_thread(mm, tcbs, None)?;

    if let Some(p) = parent {
        unsafe {
            let p = p.as_ptr();
            let t = n.as_ptr();

            (*t).exec = (*p).exec;
            (*t).callback = (*p).callback;
            (*t).thread_stack = (*p).thread_stack;
            (*t).thread_stack_size = (*p).thread_stack_size;
            (*t).caps = (*p).caps;

            // clone the saved register file so the child resumes exactly
            // where the parent trapped
            if let (Some(src), Some(dst)) = (rpc::regs_of(&*p), rpc::regs_of(&*t)) {
                *dst.as_ptr() = *src.as_ptr();
            }

            let mut resolve = |tid: Tid| {
                tcbs.get(tid)
                    .map(|o| unsafe { &raw mut (*o.as_ptr()).uvmem })
            };
            let mut on_ref = |tid: Tid| {
                if let Some(o) = tcbs.get(tid) {
                    reference_proc(o);
                }
            };

            let res = address_space::copy_uvmem(
                mm,
                &mut (*t).uvmem,
                &(*p).uvmem,
                &mut resolve,
                &mut on_ref,
            );
            if res.is_err() {
                log::error!("address space copy failed: {}", res);
                destroy_proc(mm, tcbs, n, false);
                return None;
            }
        }
    }

    Some(n)
}

/// Reserve a userspace stack for a thread out of its effective process.
pub fn alloc_stack(
    mm: &mut Mm,
    tcbs: &TcbTable,
    t: NonNull<Tcb>,
    stack_size: usize,
) -> Result<(), crate::status::Status> {
    unsafe {
        let t = t.as_ptr();
        let proc = tcbs.get((*t).eid).ok_or(crate::status::Status::ErrInval)?;
        let flags = VmFlags::VALID | VmFlags::READ | VmFlags::WRITE | VmFlags::USER;
        let (va, size) =
            address_space::alloc_uvmem(mm, &mut (*proc.as_ptr()).uvmem, stack_size, flags)?;

        (*t).thread_stack = va;
        (*t).thread_stack_size = size;
        Ok(())
    }
}

/// Destroy a non-process thread: release its id, drop its hold on the root
/// process and free its memory.
pub fn destroy_thread(mm: &mut Mm, tcbs: &TcbTable, t: NonNull<Tcb>) -> crate::status::Status {
    unsafe {
        let tp = t.as_ptr();
        if (*tp).is_proc() {
            return crate::status::Status::ErrInval;
        }

        tcbs.clear((*tp).tid);
        (*tp).state = ProcState::Dead;

        let root = tcbs.get((*tp).rid);

        destroy_tcb_memory(mm, tp);

        if let Some(root) = root {
            unreference_proc(mm, tcbs, root);
        }
    }

    crate::status::Status::Ok
}

/// Kill a process: tear down its address space immediately, keep the id
/// reserved until every member and visitor has let go. Threads stranded
/// inside it unwind through the orphan path.
///
/// `still_running` says whether the process's root thread keeps executing
/// somewhere (on a CPU or away mid-RPC). If it does, its membership
/// reference is dropped by its own eventual destruction; if not, the root
/// thread's execution is over and the reference goes now.
pub fn destroy_proc(
    mm: &mut Mm,
    tcbs: &TcbTable,
    p: NonNull<Tcb>,
    still_running: bool,
) -> crate::status::Status {
    unsafe {
        let pp = p.as_ptr();
        if !(*pp).is_proc() {
            return crate::status::Status::ErrInval;
        }

        (*pp).state = ProcState::Zombie;

        let mut on_unref = unref_sink(tcbs);
        address_space::destroy_uvmem(mm, &mut (*pp).uvmem, &mut on_unref);

        if !still_running {
            unreference_proc(mm, tcbs, p);
        }
    }

    crate::status::Status::Ok
}

/// The shared-memory unreference hook: finds the owner, drops one region
/// reference there and one thread reference.
pub fn unref_sink(tcbs: &TcbTable) -> impl FnMut(&mut Mm, Tid, VirtAddr) + '_ {
    move |mm: &mut Mm, owner: Tid, shaddr: VirtAddr| {
        let Some(o) = tcbs.get(owner) else {
            return;
        };

        unsafe {
            address_space::unref_shared_region(mm, &mut (*o.as_ptr()).uvmem, shaddr);
        }
        unreference_proc(mm, tcbs, o);
    }
}
