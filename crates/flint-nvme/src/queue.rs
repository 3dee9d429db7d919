//! Submission and completion queue rings.
//!
//! Each queue is a ring in DMA-coherent, uncached memory plus an MMIO
//! doorbell. A submission queue additionally carries one completion
//! continuation per slot and, when SGLs are in use, a DMA scratch table of
//! [`IOQ_SGLS`] descriptors per slot, indexed by command identifier.
//!
//! Slot `i` of a submission queue owns command identifier `i` for its whole
//! lifetime: completions are matched to continuations purely by CID, so the
//! device may complete out of order. A slot becomes reusable only once its
//! continuation has been taken and invoked.

use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};

use crate::cmd::{Cqe, SglDesc, Sqe};
use crate::dma::DmaBuffer;
use crate::hw::{DmaSpace, HwError, RegisterBlock};
use crate::regs::{cq_head_doorbell, sq_tail_doorbell};
use flint_block::Direction;

/// Entries per I/O queue.
pub const IOQ_SIZE: u16 = 32;
/// SGL descriptors per I/O queue entry.
pub const IOQ_SGLS: usize = 32;

pub(crate) const SQE_SIZE: usize = std::mem::size_of::<Sqe>();
pub(crate) const CQE_SIZE: usize = std::mem::size_of::<Cqe>();
pub(crate) const SGL_DESC_SIZE: usize = std::mem::size_of::<SglDesc>();

/// One-shot completion continuation, invoked with the CQE status field.
pub type Callback = Box<dyn FnOnce(u16)>;

pub struct SubmissionQueue {
    buf: Rc<DmaBuffer>,
    sgl_table: Option<Rc<DmaBuffer>>,
    regs: Rc<dyn RegisterBlock>,
    size: u16,
    qid: u16,
    dstrd: u8,
    head: u16,
    tail: u16,
    callbacks: Vec<Option<Callback>>,
}

impl SubmissionQueue {
    /// Allocates the ring (and, for `sgls > 0`, the SGL scratch table) and
    /// stamps each slot with its command identifier.
    pub fn new(
        dma: &Rc<dyn DmaSpace>,
        regs: Rc<dyn RegisterBlock>,
        size: u16,
        qid: u16,
        dstrd: u8,
        sgls: usize,
    ) -> Result<Self, HwError> {
        let buf = dma.alloc(size as usize * SQE_SIZE, Direction::ToDevice)?;
        for i in 0..size {
            let mut sqe = Sqe::default();
            sqe.set_cid(i);
            buf.write_volatile(i as usize * SQE_SIZE, sqe);
        }

        let sgl_table = if sgls > 0 {
            Some(dma.alloc(size as usize * sgls * SGL_DESC_SIZE, Direction::ToDevice)?)
        } else {
            None
        };

        Ok(Self {
            buf,
            sgl_table,
            regs,
            size,
            qid,
            dstrd,
            head: 0,
            tail: 0,
            callbacks: (0..size).map(|_| None).collect(),
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Bus address of the ring, for ASQ / Create I/O SQ.
    pub fn phys_base(&self) -> u64 {
        self.buf.paddr(0)
    }

    pub fn supports_sgl(&self) -> bool {
        self.sgl_table.is_some()
    }

    fn wrap(&self, i: u16) -> u16 {
        i % self.size
    }

    pub fn is_full(&self) -> bool {
        self.head == self.wrap(self.tail + 1)
    }

    /// Reserves the next slot and returns its command identifier.
    ///
    /// Fails when the ring is full or when the slot's previous continuation
    /// has not fired yet. The slot is handed out cleared except for its CID.
    pub fn produce(&mut self) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let cid = self.tail;
        if self.callbacks[cid as usize].is_some() {
            // The device has reported the slot free via SQHD, but the
            // continuation is still outstanding.
            return None;
        }
        let mut sqe = Sqe::default();
        sqe.set_cid(cid);
        self.buf.write_volatile(cid as usize * SQE_SIZE, sqe);
        self.tail = self.wrap(self.tail + 1);
        Some(cid)
    }

    /// Writes a produced entry into its slot, installs the continuation and
    /// rings the tail doorbell.
    pub fn push(&mut self, sqe: Sqe, cb: Callback) {
        let cid = sqe.cid();
        debug_assert!(cid < self.size);
        debug_assert!(self.callbacks[cid as usize].is_none());
        self.buf.write_volatile(cid as usize * SQE_SIZE, sqe);
        self.callbacks[cid as usize] = Some(cb);
        self.submit();
    }

    /// Publishes the current tail to the device.
    pub fn submit(&mut self) {
        // The entry stores must be visible before the doorbell write.
        fence(Ordering::SeqCst);
        self.regs
            .write32(sq_tail_doorbell(self.qid, self.dstrd), self.tail as u32);
    }

    /// Frees slots up to the head pointer reported in a completion.
    pub fn set_head(&mut self, head: u16) {
        debug_assert!(head < self.size);
        self.head = head;
    }

    /// Detaches the continuation for `cid`; the caller invokes it exactly
    /// once after releasing its borrow of the queue.
    pub fn take_callback(&mut self, cid: u16) -> Option<Callback> {
        self.callbacks.get_mut(cid as usize)?.take()
    }

    /// Bus address of the SGL descriptor table slice owned by `cid`.
    pub fn sgl_slot_paddr(&self, cid: u16) -> u64 {
        let table = self.sgl_table.as_ref().expect("queue created without SGL table");
        table.paddr(cid as usize * IOQ_SGLS * SGL_DESC_SIZE)
    }

    /// Writes descriptor `index` of the table slice owned by `cid`.
    pub fn write_sgl(&self, cid: u16, index: usize, desc: SglDesc) {
        debug_assert!(index < IOQ_SGLS);
        let table = self.sgl_table.as_ref().expect("queue created without SGL table");
        table.write_volatile(
            cid as usize * IOQ_SGLS * SGL_DESC_SIZE + index * SGL_DESC_SIZE,
            desc,
        );
    }
}

impl std::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("qid", &self.qid)
            .field("size", &self.size)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish_non_exhaustive()
    }
}

pub struct CompletionQueue {
    buf: Rc<DmaBuffer>,
    regs: Rc<dyn RegisterBlock>,
    size: u16,
    qid: u16,
    dstrd: u8,
    head: u16,
    phase: bool,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("qid", &self.qid)
            .field("size", &self.size)
            .field("head", &self.head)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CompletionQueue {
    pub fn new(
        dma: &Rc<dyn DmaSpace>,
        regs: Rc<dyn RegisterBlock>,
        size: u16,
        qid: u16,
        dstrd: u8,
    ) -> Result<Self, HwError> {
        let buf = dma.alloc(size as usize * CQE_SIZE, Direction::FromDevice)?;
        Ok(Self {
            buf,
            regs,
            size,
            qid,
            dstrd,
            head: 0,
            phase: true,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Bus address of the ring, for ACQ / Create I/O CQ.
    pub fn phys_base(&self) -> u64 {
        self.buf.paddr(0)
    }

    /// Returns the entry at the head if the device has published one.
    ///
    /// An entry is valid iff its phase tag matches the expected phase; the
    /// expected phase flips whenever the head wraps. The phase word is read
    /// before the rest of the entry; it is the only synchronization with
    /// the device.
    pub fn consume(&mut self) -> Option<Cqe> {
        let off = self.head as usize * CQE_SIZE;
        let dw3: u32 = self.buf.read_volatile(off + 12);
        if (dw3 & (1 << 16) != 0) != self.phase {
            return None;
        }
        let cqe = Cqe {
            dw0: self.buf.read_volatile(off),
            dw1: self.buf.read_volatile(off + 4),
            dw2: self.buf.read_volatile(off + 8),
            dw3,
        };
        self.head = (self.head + 1) % self.size;
        if self.head == 0 {
            self.phase = !self.phase;
        }
        Some(cqe)
    }

    /// Publishes the current head to the device, freeing consumed entries.
    pub fn complete(&mut self) {
        self.regs
            .write32(cq_head_doorbell(self.qid, self.dstrd), self.head as u32);
    }
}
