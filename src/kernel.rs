/*
 * Kernel State
 *
 * The single bundle of mutable kernel state and its big kernel lock. All
 * non-trap-entry kernel code runs with the lock held; the arch trap glue
 * acquires it on entry (kernel::with) and releases it right before the
 * return-to-userspace sequence. Context switches happen only at that
 * boundary.
 *
 * Bootstrap hands over what it learned from the device tree in a BootInfo;
 * from there the kernel builds the physical map, the region-node slab and
 * the thread table, and spawns the init process around the entry point the
 * (external) ELF loader produced.
 */

use core::ptr::NonNull;

use spin::{Mutex, Once};

use crate::arch;
use crate::config::{self, PagingMode, RuntimeConf, VmLayout};
use crate::irq::IrqTable;
use crate::memory::phys::{self, AvoidRegion};
use crate::memory::region::{Mm, RegionPool};
use crate::memory::{OrderTable, PhysAddr, VirtAddr, physmap};
use crate::status::Status;
use crate::thread::notify::{self, NotifyFlags};
use crate::thread::tcb::{self, Cpus, Tcb, TcbTable};
use crate::thread::{CpuId, Tid};

/// Hook into the external program loader: (kernel, caller, target, binary
/// address, interpreter address). Installed by the bootstrap; exec/spawn
/// fail with ERR_NOINIT without one.
pub type ProcLoader =
    fn(&mut Kernel, caller: Tid, target: Tid, bin: VirtAddr, interp: VirtAddr) -> Status;

/// Everything the bootstrap learned that the kernel core needs.
pub struct BootInfo {
    /// Paging mode probed on the boot hart.
    pub mode: PagingMode,
    /// Direct-map displacement: VA = PA + dmap_offset.
    pub dmap_offset: usize,
    /// RAM range from the device tree /memory node.
    pub ram_base: PhysAddr,
    pub ram_size: usize,
    /// Where the kernel image sits and how big it is.
    pub kernel_image: (PhysAddr, usize),
    /// Initrd range from /chosen, when present.
    pub initrd: Option<(PhysAddr, usize)>,
    /// The flattened device tree itself.
    pub fdt: Option<(PhysAddr, usize)>,
    /// Every /reserved-memory range.
    pub reserved: heapless::Vec<AvoidRegion, 64>,
}

/// The kernel.
pub struct Kernel {
    pub mm: Mm,
    pub tcbs: TcbTable,
    pub cpus: Cpus,
    pub conf: RuntimeConf,
    pub irqs: IrqTable,
    pub mode: PagingMode,
    pub ram_base: PhysAddr,
    pub ram_size: usize,
    pub loader: Option<ProcLoader>,
}

impl Kernel {
    /// Build the kernel from boot facts: fix the global geometry, place and
    /// populate the physical map, reserve everything the bootstrap knows
    /// about and set up the slab and thread tables.
    pub fn bootstrap(info: BootInfo) -> Result<Kernel, Status> {
        config::init_layout(VmLayout::for_mode(info.mode));
        crate::memory::init_orders(OrderTable::for_mode(info.mode));
        physmap::init(info.dmap_offset);

        let mut avoid = info.reserved;
        let (kernel_base, kernel_size) = info.kernel_image;
        avoid
            .push(AvoidRegion {
                base: kernel_base,
                size: kernel_size,
            })
            .map_err(|_| Status::ErrOomem)?;

        for extra in [info.initrd, info.fdt].into_iter().flatten() {
            avoid
                .push(AvoidRegion {
                    base: extra.0,
                    size: extra.1,
                })
                .map_err(|_| Status::ErrOomem)?;
        }

        let mut pmem = phys::init_pmem(info.ram_base, info.ram_size, &mut avoid)?;

        let nodes = RegionPool::new(&mut pmem).ok_or(Status::ErrOomem)?;
        let mut mm = Mm { pmem, nodes };

        let tcbs = TcbTable::new(&mut mm).ok_or(Status::ErrOomem)?;
        log::info!("thread table ready, {} ids", tcbs.capacity());

        Ok(Kernel {
            mm,
            tcbs,
            cpus: Cpus::new(),
            conf: RuntimeConf::default(),
            irqs: IrqTable::new(),
            mode: info.mode,
            ram_base: info.ram_base,
            ram_size: info.ram_size,
            loader: None,
        })
    }

    /// Currently executing thread of a CPU.
    pub fn current(&self, cpu: CpuId) -> Option<NonNull<Tcb>> {
        self.cpus.current(cpu)
    }

    /// Make `t` the current thread of `cpu` and point the MMU at its
    /// active table.
    pub fn use_tcb(&mut self, cpu: CpuId, t: NonNull<Tcb>) {
        unsafe {
            (*t.as_ptr()).cpu_id = cpu;
            self.cpus.set_current(cpu, t.as_ptr());
            arch::use_vmem((*t.as_ptr()).active_vmem(), self.mode);
        }
    }

    /// Create the init process: full capability set, entry at `entry`, a
    /// fresh user stack, and the boot CPU assigned to it.
    pub fn spawn_init(&mut self, cpu: CpuId, entry: VirtAddr) -> Result<Tid, Status> {
        let t = tcb::create_proc(&mut self.mm, &mut self.tcbs, None)
            .ok_or(Status::ErrOomem)?;

        unsafe {
            let tp = t.as_ptr();
            (*tp).caps = crate::caps::CapSet::all();
            (*tp).exec = entry;
        }

        tcb::alloc_stack(&mut self.mm, &self.tcbs, t, self.conf.thread_stack_size)?;

        unsafe {
            let tp = t.as_ptr();
            if let Some(regs) = crate::thread::rpc::regs_of(&*tp) {
                (*regs.as_ptr()).sp =
                    (*tp).thread_stack.add((*tp).thread_stack_size).as_usize();
            }

            self.use_tcb(cpu, t);
            Ok((*tp).tid)
        }
    }

    /// External timer/driver interface: queue a notification for a thread
    /// and deliver it if the rules allow.
    pub fn post_notification(&mut self, cpu: CpuId, tid: Tid, flags: NotifyFlags) {
        let Some(t) = self.tcbs.get(tid) else {
            return;
        };

        notify::notify(self, cpu, t, flags);
    }

    /// A hardware interrupt fired; route it to whoever claimed the line.
    pub fn handle_irq(&mut self, cpu: CpuId, irq: usize) {
        let Some(tid) = self.irqs.handler(irq) else {
            log::warn!("unclaimed irq {}", irq);
            return;
        };

        self.post_notification(cpu, tid, NotifyFlags::IRQ);
    }

    /// An IPI arrived: drain deferred notification work for the current
    /// thread of this CPU.
    pub fn handle_ipi(&mut self, cpu: CpuId) {
        self.cpus.pending_ipi[cpu] = false;

        if let Some(t) = self.cpus.current(cpu) {
            notify::notify(self, cpu, t, NotifyFlags::empty());
        }
    }
}

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Publish the bootstrapped kernel behind the big kernel lock.
pub fn install(kernel: Kernel) {
    KERNEL.call_once(|| Mutex::new(kernel));
}

/// Run a closure with the big kernel lock held. The trap glue wraps every
/// kernel entry in this; everything inside runs serialized.
pub fn with<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let mut guard = KERNEL
        .get()
        .expect("kernel not installed")
        .lock();
    f(&mut guard)
}
