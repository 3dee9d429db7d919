//! The NVMe controller.
//!
//! One [`Controller`] instance per NVMe PCI function. Construction performs
//! the synchronous bring-up sequence (reset, admin queues, enable,
//! bus-master). Everything after that (identification, namespace discovery,
//! I/O queue creation) is asynchronous and driven by admin-command
//! continuations dispatched from [`Controller::handle_irq`].
//!
//! The admin queues are fixed at the minimum legal size of two entries, so
//! at most one admin command is ever in flight. Discovery therefore cannot
//! loop over namespaces imperatively; each Identify continuation issues the
//! next Identify, forming a tail-chained asynchronous loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, info, warn};

use flint_block::Direction;

use crate::cmd::{admin_opc, cns, id_ctrl, id_ns, psdt, Sqe};
use crate::dma::DmaBuffer;
use crate::error::{NvmeError, Result};
use crate::hw::{
    DmaSpace, IrqController, IrqHandle, IrqTrigger, PciFunction, RegisterBlock,
};
use crate::ns::Namespace;
use crate::queue::{Callback, CompletionQueue, SubmissionQueue};
use crate::regs::{self, Aqa, Cap, Cc, Csts, Version, ADMIN_QID, AMS_RR, CSS_NVM};
use crate::PAGE_SHIFT;

/// Entries per admin queue. The minimum legal size; with the fullness rule
/// this leaves exactly one usable slot and serializes all admin work.
pub const AQ_ENTRIES: u16 = 2;

/// Invoked once for every namespace that completed initialization. The
/// receiver wraps the namespace in a block device, registers it with the
/// manager and returns it to the controller via [`Controller::add_ns`].
pub type PublishFn = Rc<dyn Fn(Rc<Namespace>)>;

/// Static configuration threaded through controller construction.
#[derive(Debug, Clone, Copy)]
pub struct CtrlConfig {
    /// Gate for scatter/gather lists; effective use additionally requires
    /// controller support (`SGLS[1:0] != 0`).
    pub use_sgls: bool,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self { use_sgls: true }
    }
}

struct IrqBinding {
    handle: Rc<dyn IrqHandle>,
    trigger: IrqTrigger,
}

pub struct Controller {
    pci: Box<dyn PciFunction>,
    dma: Rc<dyn DmaSpace>,
    regs: Rc<dyn RegisterBlock>,
    config: CtrlConfig,
    cap: Cap,
    asq: RefCell<SubmissionQueue>,
    acq: RefCell<CompletionQueue>,
    namespaces: RefCell<Vec<Rc<Namespace>>>,
    serial: RefCell<String>,
    sgls: Cell<bool>,
    mdts: Cell<u8>,
    irq: RefCell<Option<IrqBinding>>,
}

/// Tests a PCI function's class code for mass-storage / non-volatile-memory
/// / NVMe (`0x01/0x08/0x02`).
pub fn is_nvme_function(pci: &dyn PciFunction) -> bool {
    matches!(pci.config_read32(8), Ok(v) if v >> 8 == 0x0001_0802)
}

impl Controller {
    /// Brings the controller up and leaves it ready for
    /// [`Controller::identify`].
    ///
    /// The sequence follows the NVMe initialization flow: map BAR0, check
    /// the command set, reset, size and place the admin queues, enable, and
    /// finally make the function a bus master. The wait for `CSTS.RDY` is
    /// an unbounded spin; callers wanting a watchdog run this under one.
    pub fn new(
        pci: Box<dyn PciFunction>,
        dma: Rc<dyn DmaSpace>,
        config: CtrlConfig,
    ) -> Result<Rc<Self>> {
        let bar = read_bar(&*pci)?;
        let regs = pci.map_registers(bar)?;

        let cap = Cap(regs.read64(regs::CAP));
        let version = Version(regs.read32(regs::VS));
        debug!(bar = format_args!("{bar:#x}"), cap = format_args!("{:#x}", cap.0), %version,
            "controller registers mapped");

        if !cap.supports_nvm() {
            return Err(NvmeError::NoNvmCommandSet);
        }

        // Reset first, mostly to get the admin queue doorbells into a known
        // state.
        regs.write32(regs::CC, 0);

        let mut aqa = Aqa::default();
        aqa.set_acqs(AQ_ENTRIES - 1);
        aqa.set_asqs(AQ_ENTRIES - 1);
        regs.write32(regs::AQA, aqa.0);

        let acq = CompletionQueue::new(&dma, regs.clone(), AQ_ENTRIES, ADMIN_QID, cap.dstrd())?;
        let asq = SubmissionQueue::new(&dma, regs.clone(), AQ_ENTRIES, ADMIN_QID, cap.dstrd(), 0)?;
        regs.write64(regs::ACQ, acq.phys_base());
        regs.write64(regs::ASQ, asq.phys_base());

        // QEMU insists on the I/O entry sizes being set no later than
        // enable time, although real controllers only need them before the
        // first Create I/O Queue command.
        let mut cc = Cc::default();
        cc.set_iocqes(4); // 16-byte completion entries
        cc.set_iosqes(6); // 64-byte submission entries
        cc.set_ams(AMS_RR);

        let mps = (PAGE_SHIFT - 12) as u8;
        if cap.mpsmin() > mps || cap.mpsmax() < mps {
            return Err(NvmeError::UnsupportedPageSize {
                mpsmin: cap.mpsmin(),
                mpsmax: cap.mpsmax(),
            });
        }
        cc.set_mps(mps);
        cc.set_css(CSS_NVM);
        cc.set_en(true);
        regs.write32(regs::CC, cc.0);

        debug!("waiting for the controller to become ready");
        while !Csts(regs.read32(regs::CSTS)).rdy() {
            std::hint::spin_loop();
        }

        let pci_cmd = pci.config_read16(0x04)?;
        if pci_cmd & 0x4 == 0 {
            debug!("enabling PCI bus master");
            pci.config_write16(0x04, pci_cmd | 0x4)?;
        }

        Ok(Rc::new(Self {
            pci,
            dma,
            regs,
            config,
            cap,
            asq: RefCell::new(asq),
            acq: RefCell::new(acq),
            namespaces: RefCell::new(Vec::new()),
            serial: RefCell::new(String::new()),
            sgls: Cell::new(false),
            mdts: Cell::new(0),
            irq: RefCell::new(None),
        }))
    }

    pub fn cap(&self) -> Cap {
        self.cap
    }

    /// Controller serial number, known once identification has run.
    pub fn serial(&self) -> String {
        self.serial.borrow().clone()
    }

    /// Maximum Data Transfer Size exponent reported by the controller
    /// (zero: unlimited).
    pub fn mdts(&self) -> u8 {
        self.mdts.get()
    }

    /// Whether commands may use scatter/gather lists: requires both the
    /// configuration gate and controller support.
    pub fn supports_sgl(&self) -> bool {
        self.config.use_sgls && self.sgls.get()
    }

    pub fn dma(&self) -> &Rc<dyn DmaSpace> {
        &self.dma
    }

    /// Takes permanent ownership of a published namespace.
    pub fn add_ns(&self, ns: Rc<Namespace>) {
        self.namespaces.borrow_mut().push(ns);
    }

    /// Registers the controller with the interrupt facility.
    ///
    /// Order matters: all controller vectors are masked before the line is
    /// bound and unmasked, and only unmasked again (`INTMC`) once the
    /// handler can run.
    pub fn register_interrupt_handler(&self, icu: &dyn IrqController) -> Result<()> {
        let irq_info = self.pci.enable_interrupt()?;
        info!(irq = irq_info.irq, trigger = ?irq_info.trigger, "device interrupt enabled");

        self.regs.write32(regs::INTMS, !0);
        let handle = icu.bind(irq_info.irq)?;
        handle.unmask();
        self.regs.write32(regs::INTMC, !0);

        self.irq.replace(Some(IrqBinding {
            handle,
            trigger: irq_info.trigger,
        }));
        Ok(())
    }

    /// Dispatches one controller interrupt.
    ///
    /// Consumes at most one admin completion (the depth-2 admin queue has
    /// at most one command outstanding), then fully drains every
    /// namespace's completion queue. Level-triggered lines are unmasked
    /// again afterwards.
    pub fn handle_irq(&self) {
        let cqe = self.acq.borrow_mut().consume();
        if let Some(cqe) = cqe {
            debug_assert_eq!(cqe.sq_id(), ADMIN_QID);
            let cb = {
                let mut asq = self.asq.borrow_mut();
                asq.set_head(cqe.sq_head());
                asq.take_callback(cqe.cid())
            };
            debug_assert!(cb.is_some(), "admin completion without continuation");
            if let Some(cb) = cb {
                // Borrows are released: the continuation re-enters the
                // admin queue to issue the next command of its chain.
                cb(cqe.status());
            }
            self.acq.borrow_mut().complete();
        }

        let namespaces: Vec<_> = self.namespaces.borrow().clone();
        for ns in namespaces {
            ns.handle_irq();
        }

        if let Some(irq) = self.irq.borrow().as_ref() {
            if irq.trigger == IrqTrigger::Level {
                irq.handle.unmask();
            }
        }
    }

    /// Identifies the controller, then every namespace, publishing each
    /// usable one.
    ///
    /// `publish` runs once per namespace whose I/O queues came up; the
    /// receiver is expected to hand the namespace back via
    /// [`Controller::add_ns`].
    pub fn identify(self: &Rc<Self>, publish: PublishFn) -> Result<()> {
        let data = self.dma.alloc(4096, Direction::FromDevice)?;

        let mut sqe = Sqe::new(admin_opc::IDENTIFY);
        sqe.set_psdt(psdt::PRP);
        sqe.set_prps(data.paddr(0), 0);
        sqe.set_cns(cns::IDENTIFY_CONTROLLER);

        let this = self.clone();
        self.submit_admin(
            sqe,
            Box::new(move |status| this.on_identified(status, data, publish)),
        )
    }

    fn on_identified(self: Rc<Self>, status: u16, data: Rc<DmaBuffer>, publish: PublishFn) {
        if status != 0 {
            warn!(status, "Identify Controller failed");
            return;
        }

        let serial = ascii_until_space(&data.read_bytes::<20>(id_ctrl::SN));
        let model = ascii_trimmed(&data.read_bytes::<40>(id_ctrl::MN));
        let firmware = ascii_trimmed(&data.read_bytes::<8>(id_ctrl::FR));
        let cntlid = u16::from_le_bytes(data.read_bytes::<2>(id_ctrl::CNTLID));
        let sgls = u32::from_le_bytes(data.read_bytes::<4>(id_ctrl::SGLS));
        let mdts = data.read_volatile::<u8>(id_ctrl::MDTS);
        let nn = u32::from_le_bytes(data.read_bytes::<4>(id_ctrl::NN));

        self.sgls.set(sgls & 0x3 != 0);
        self.mdts.set(mdts);

        info!(
            %serial,
            %model,
            %firmware,
            cntlid,
            sgl = self.sgls.get(),
            mdts,
            nn,
            "controller identified"
        );
        *self.serial.borrow_mut() = serial;

        // The device is done with the buffer; release its mapping before
        // the next command.
        data.unmap();

        // Identify all namespaces. This runs as an asynchronous loop over
        // the chain of continuations because the admin queue is as small
        // as possible.
        self.continue_identify(nn, 1, &publish);
    }

    /// Issues the Identify for namespace `next` unless the chain is done.
    /// Every chain-advance site funnels through here.
    pub(crate) fn continue_identify(self: &Rc<Self>, nn: u32, next: u32, publish: &PublishFn) {
        if next > nn {
            return;
        }
        if let Err(e) = self.identify_namespace(nn, next, publish.clone()) {
            warn!(nsid = next, error = %e, "could not continue namespace identification");
        }
    }

    fn identify_namespace(self: &Rc<Self>, nn: u32, nsid: u32, publish: PublishFn) -> Result<()> {
        let data = self.dma.alloc(4096, Direction::FromDevice)?;

        let mut sqe = Sqe::new(admin_opc::IDENTIFY);
        sqe.nsid = nsid;
        sqe.set_psdt(psdt::PRP);
        sqe.set_prps(data.paddr(0), 0);
        sqe.set_cns(cns::IDENTIFY_NAMESPACE);

        let this = self.clone();
        self.submit_admin(
            sqe,
            Box::new(move |status| this.on_ns_identified(status, nsid, nn, data, publish)),
        )
    }

    fn on_ns_identified(
        self: Rc<Self>,
        status: u16,
        nsid: u32,
        nn: u32,
        data: Rc<DmaBuffer>,
        publish: PublishFn,
    ) {
        if status != 0 {
            // The chain stops here by design: a failing Identify suggests
            // the controller is in trouble, not just this namespace.
            warn!(nsid, status, "Identify Namespace failed");
            return;
        }

        let nsze = u64::from_le_bytes(data.read_bytes::<8>(id_ns::NSZE));
        let ncap = u64::from_le_bytes(data.read_bytes::<8>(id_ns::NCAP));
        let nuse = u64::from_le_bytes(data.read_bytes::<8>(id_ns::NUSE));
        let nlbaf = data.read_volatile::<u8>(id_ns::NLBAF);
        let flbas = data.read_volatile::<u8>(id_ns::FLBAS);
        debug!(nsid, nsze, ncap, nuse, nlbaf, flbas, "namespace identified");

        let f = (flbas & 0xF) as usize;
        let mut skipped = true;
        if nsze == 0 {
            debug!(nsid, "skipping inactive namespace");
        } else if f > nlbaf as usize {
            debug!(nsid, flbas, "formatted LBA index out of range, skipping");
        } else {
            let lbaf = u32::from_le_bytes(data.read_bytes::<4>(id_ns::LBAF0 + f * 4));
            if lbaf & 0xFFFF != 0 {
                debug!(nsid, "LBA format carries metadata, skipping");
            } else {
                let lba_size = 1usize << ((lbaf >> 16) & 0xFF);
                skipped = false;
                let ns = Rc::new(Namespace::from_identify(&self, nsid, lba_size, &data));
                ns.async_loop_init(nn, publish.clone());
            }
        }

        data.unmap();

        if skipped {
            // A usable namespace advances the chain from its queue-creation
            // continuations instead; see `Namespace::async_loop_init`.
            self.continue_identify(nn, nsid + 1, &publish);
        }
    }

    /// Allocates an I/O completion queue and issues Create I/O CQ for it.
    /// `cb` fires with the command status; the queue is live on success.
    pub(crate) fn create_iocq(&self, qid: u16, size: u16, cb: Callback) -> Result<CompletionQueue> {
        let cq = CompletionQueue::new(&self.dma, self.regs.clone(), size, qid, self.cap.dstrd())?;

        let mut sqe = Sqe::new(admin_opc::CREATE_IOCQ);
        sqe.set_psdt(psdt::PRP);
        sqe.set_prps(cq.phys_base(), 0);
        sqe.set_qid_qsize(qid, size - 1);
        sqe.set_ien(true);
        sqe.set_pc(true);
        self.submit_admin(sqe, cb)?;
        Ok(cq)
    }

    /// Allocates an I/O submission queue (with an SGL scratch table when
    /// `sgls > 0`) and issues Create I/O SQ targeting the completion queue
    /// of the same id.
    pub(crate) fn create_iosq(
        &self,
        qid: u16,
        size: u16,
        sgls: usize,
        cb: Callback,
    ) -> Result<SubmissionQueue> {
        let sq =
            SubmissionQueue::new(&self.dma, self.regs.clone(), size, qid, self.cap.dstrd(), sgls)?;

        let mut sqe = Sqe::new(admin_opc::CREATE_IOSQ);
        sqe.set_psdt(psdt::PRP);
        sqe.set_prps(sq.phys_base(), 0);
        sqe.set_qid_qsize(qid, size - 1);
        sqe.set_pc(true);
        sqe.set_cqid(qid);
        self.submit_admin(sqe, cb)?;
        Ok(sq)
    }

    fn submit_admin(&self, mut sqe: Sqe, cb: Callback) -> Result<()> {
        let mut asq = self.asq.borrow_mut();
        let cid = asq.produce().ok_or(NvmeError::Busy)?;
        sqe.set_cid(cid);
        asq.push(sqe, cb);
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cap", &format_args!("{:#x}", self.cap.0))
            .field("serial", &self.serial.borrow())
            .field("namespaces", &self.namespaces.borrow().len())
            .finish_non_exhaustive()
    }
}

fn read_bar(pci: &dyn PciFunction) -> Result<u64> {
    let low = pci.config_read32(0x10)? as u64;
    let high = pci.config_read32(0x14)? as u64;
    Ok(((high << 32) | low) & !0xFFF)
}

/// ASCII field, truncated at the first space (serial numbers are
/// space padded and must match the shortest form clients use).
fn ascii_until_space(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != b' ' && b != 0)
        .map(|&b| b as char)
        .collect()
}

/// ASCII field with trailing padding removed.
fn ascii_trimmed(bytes: &[u8]) -> String {
    let s: String = bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    s.trim_end().to_string()
}
