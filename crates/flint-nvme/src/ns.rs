//! Namespaces.
//!
//! A [`Namespace`] is created for every active, metadata-free namespace the
//! identify chain discovers. It owns the namespace's I/O queue pair (queue
//! id == namespace id) and prepares and submits the NVM commands for it.
//!
//! Initialization is fully asynchronous: the I/O completion queue must exist
//! before the submission queue that targets it, so `async_loop_init` chains
//! two admin commands and only then publishes the namespace upstream. A
//! namespace that fails either step is dropped by its own continuation,
//! since nothing else owns it yet, and the identify chain moves on to the next
//! namespace id.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::cmd::{id_ns, nvm_opc, psdt, sgl_id, Dlfeat, SglDesc, Sqe, NSATTR_WP};
use crate::ctrl::{Controller, PublishFn};
use crate::dma::DmaBuffer;
use crate::error::{NvmeError, Result};
use crate::queue::{Callback, CompletionQueue, SubmissionQueue, IOQ_SGLS, IOQ_SIZE, SGL_DESC_SIZE};
use crate::{trunc_page, PAGE_SIZE};

/// A prepared, not yet submitted, Read or Write command.
#[derive(Debug)]
pub struct IoCmd {
    pub(crate) sqe: Sqe,
}

impl IoCmd {
    /// Command identifier, which is also the index of the SGL descriptor
    /// table slice owned by this command.
    pub fn cid(&self) -> u16 {
        self.sqe.cid()
    }
}

pub struct Namespace {
    ctl: Weak<Controller>,
    nsid: u32,
    lba_size: usize,
    nsze: u64,
    read_only: bool,
    dlfeat: Dlfeat,
    iocq: RefCell<Option<CompletionQueue>>,
    iosq: RefCell<Option<SubmissionQueue>>,
}

impl Namespace {
    /// Builds a namespace from an Identify Namespace payload. The selected
    /// LBA format has already been vetted (active, metadata-free) by the
    /// identify chain.
    pub(crate) fn from_identify(
        ctl: &Rc<Controller>,
        nsid: u32,
        lba_size: usize,
        data: &DmaBuffer,
    ) -> Self {
        let nsze = u64::from_le_bytes(data.read_bytes::<8>(id_ns::NSZE));
        let read_only = data.read_volatile::<u8>(id_ns::NSATTR) & NSATTR_WP != 0;
        let dlfeat = Dlfeat(data.read_volatile::<u8>(id_ns::DLFEAT));
        Self {
            ctl: Rc::downgrade(ctl),
            nsid,
            lba_size,
            nsze,
            read_only,
            dlfeat,
            iocq: RefCell::new(None),
            iosq: RefCell::new(None),
        }
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Size of one logical block in bytes.
    pub fn lba_size(&self) -> usize {
        self.lba_size
    }

    /// Namespace size in logical blocks.
    pub fn nsze(&self) -> u64 {
        self.nsze
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn dlfeat(&self) -> Dlfeat {
        self.dlfeat
    }

    /// I/O queue identifier. The namespace id doubles as the queue id;
    /// valid namespace ids and valid I/O queue ids both start at 1.
    pub fn qid(&self) -> u16 {
        debug_assert!(self.nsid < 65536);
        self.nsid as u16
    }

    pub(crate) fn ctl(&self) -> Rc<Controller> {
        self.ctl.upgrade().expect("controller outlives its namespaces")
    }

    /// Creates the I/O queue pair, then hands the namespace to `publish`.
    ///
    /// Runs as a chain of admin-command continuations. Whatever the
    /// outcome, the identify chain for namespace `nsid + 1` is kicked off
    /// from exactly one site: the submission-queue continuation (reached on
    /// CQ success), or the failure paths below.
    pub(crate) fn async_loop_init(self: &Rc<Self>, nn: u32, publish: PublishFn) {
        let ctl = self.ctl();
        let ns = self.clone();
        let publish_next = publish.clone();
        match ctl.create_iocq(
            self.qid(),
            IOQ_SIZE,
            Box::new(move |status| ns.on_iocq_created(status, nn, publish_next)),
        ) {
            Ok(cq) => {
                self.iocq.borrow_mut().replace(cq);
            }
            Err(e) => {
                warn!(nsid = self.nsid, error = %e, "I/O completion queue setup failed");
                // The continuation was never installed; advance the chain
                // here and let the namespace drop.
                ctl.continue_identify(nn, self.nsid + 1, &publish);
            }
        }
    }

    fn on_iocq_created(self: Rc<Self>, status: u16, nn: u32, publish: PublishFn) {
        let ctl = self.ctl();
        if status != 0 {
            warn!(nsid = self.nsid, status, "Create I/O Completion Queue failed");
            ctl.continue_identify(nn, self.nsid + 1, &publish);
            return; // drops the half-initialized namespace
        }

        let sgls = if ctl.supports_sgl() { IOQ_SGLS } else { 0 };
        let ns = self.clone();
        let publish_next = publish.clone();
        match ctl.create_iosq(
            self.qid(),
            IOQ_SIZE,
            sgls,
            Box::new(move |status| ns.on_iosq_created(status, nn, publish_next)),
        ) {
            Ok(sq) => {
                self.iosq.borrow_mut().replace(sq);
            }
            Err(e) => {
                warn!(nsid = self.nsid, error = %e, "I/O submission queue setup failed");
                ctl.continue_identify(nn, self.nsid + 1, &publish);
            }
        }
    }

    fn on_iosq_created(self: Rc<Self>, status: u16, nn: u32, publish: PublishFn) {
        let ctl = self.ctl();
        // Advance the identify chain before looking at the status, so
        // discovery survives a failed queue creation.
        ctl.continue_identify(nn, self.nsid + 1, &publish);

        if status != 0 {
            warn!(nsid = self.nsid, status, "Create I/O Submission Queue failed");
            return; // drops the namespace together with its queues
        }

        debug!(nsid = self.nsid, lba_size = self.lba_size, "namespace initialized");
        publish(self.clone());
    }

    /// Drains the I/O completion queue, dispatching each entry to its
    /// continuation.
    pub fn handle_irq(&self) {
        loop {
            let cqe = {
                let mut iocq = self.iocq.borrow_mut();
                match iocq.as_mut() {
                    Some(cq) => cq.consume(),
                    None => None,
                }
            };
            let Some(cqe) = cqe else { break };
            debug_assert_eq!(cqe.sq_id(), self.qid());

            let cb = {
                let mut iosq = self.iosq.borrow_mut();
                let sq = iosq.as_mut().expect("I/O SQ exists while completions arrive");
                sq.set_head(cqe.sq_head());
                sq.take_callback(cqe.cid())
            };
            debug_assert!(cb.is_some(), "completion without continuation");
            if let Some(cb) = cb {
                // Borrows are released: the continuation may submit again.
                cb(cqe.status());
            }

            if let Some(cq) = self.iocq.borrow_mut().as_mut() {
                cq.complete();
            }
        }
    }

    /// Prepares a Read or Write in PRP mode for a physically contiguous
    /// buffer of `len` bytes at `paddr`.
    ///
    /// A single PRP pair covers at most two adjacent pages; anything wider
    /// would need a PRP list and fails with
    /// [`NvmeError::UnsupportedTransfer`] before a queue slot is consumed.
    pub fn prepare_rw_prp(&self, read: bool, slba: u64, paddr: u64, len: usize) -> Result<IoCmd> {
        debug_assert!(len > 0);
        let first = trunc_page(paddr);
        let last = trunc_page(paddr + len as u64 - 1);
        let prp2 = if first == last {
            0 // reserved: one page is enough
        } else if last == first + PAGE_SIZE as u64 {
            last
        } else {
            return Err(NvmeError::UnsupportedTransfer);
        };

        let mut iosq = self.iosq.borrow_mut();
        let iosq = iosq.as_mut().expect("namespace I/O queues initialized");
        let cid = iosq.produce().ok_or(NvmeError::Busy)?;

        let mut sqe = Sqe::new(if read { nvm_opc::READ } else { nvm_opc::WRITE });
        sqe.set_cid(cid);
        sqe.nsid = self.nsid;
        sqe.set_psdt(psdt::PRP);
        sqe.set_prps(paddr, prp2);
        sqe.set_slba(slba);
        Ok(IoCmd { sqe })
    }

    /// Prepares a Read or Write in SGL mode. The data descriptors are
    /// written with [`Namespace::write_sgl`] into the scratch slice owned
    /// by the returned command.
    pub fn prepare_rw_sgl(&self, read: bool, slba: u64) -> Result<IoCmd> {
        let mut iosq = self.iosq.borrow_mut();
        let iosq = iosq.as_mut().expect("namespace I/O queues initialized");
        debug_assert!(iosq.supports_sgl());
        let cid = iosq.produce().ok_or(NvmeError::Busy)?;

        let mut sqe = Sqe::new(if read { nvm_opc::READ } else { nvm_opc::WRITE });
        sqe.set_cid(cid);
        sqe.nsid = self.nsid;
        sqe.set_psdt(psdt::SGL);
        sqe.set_sgl1(iosq.sgl_slot_paddr(cid), sgl_id::LAST_SEGMENT_ADDR);
        sqe.set_slba(slba);
        Ok(IoCmd { sqe })
    }

    /// Writes data descriptor `index` of command `cid`'s SGL slice.
    pub fn write_sgl(&self, cid: u16, index: usize, desc: SglDesc) {
        let iosq = self.iosq.borrow();
        iosq.as_ref()
            .expect("namespace I/O queues initialized")
            .write_sgl(cid, index, desc);
    }

    /// Finalizes and submits a prepared Read or Write.
    ///
    /// `nlb` is the 0-based logical block count; `segments` the number of
    /// SGL descriptors written (ignored in PRP mode). The continuation
    /// fires from the interrupt path with the completion status.
    pub fn submit_rw(&self, mut io: IoCmd, nlb: u16, segments: usize, cb: Callback) {
        if io.sqe.psdt() == psdt::SGL {
            io.sqe.set_sgl1_len((segments * SGL_DESC_SIZE) as u32);
        }
        io.sqe.set_nlb(nlb);
        let mut iosq = self.iosq.borrow_mut();
        iosq.as_mut()
            .expect("namespace I/O queues initialized")
            .push(io.sqe, cb);
    }

    /// Submits a Write Zeroes for `nlb + 1` blocks starting at `slba`.
    /// With `deallocate`, hints that the blocks may be unmapped.
    pub fn write_zeroes(&self, slba: u64, nlb: u16, deallocate: bool, cb: Callback) -> Result<()> {
        let mut iosq = self.iosq.borrow_mut();
        let iosq = iosq.as_mut().expect("namespace I/O queues initialized");
        let cid = iosq.produce().ok_or(NvmeError::Busy)?;

        let mut sqe = Sqe::new(nvm_opc::WRITE_ZEROES);
        sqe.set_cid(cid);
        sqe.nsid = self.nsid;
        sqe.set_slba(slba);
        sqe.set_nlb(nlb);
        sqe.set_deac(deallocate);
        iosq.push(sqe, cb);
        Ok(())
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("nsid", &self.nsid)
            .field("lba_size", &self.lba_size)
            .field("nsze", &self.nsze)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}
