//! Block-device adapter.
//!
//! [`NvmeDisk`] presents one [`Namespace`] through
//! [`flint_block::BlockDevice`], translating the manager's chained I/O
//! descriptors into PRP- or SGL-mode NVM commands. The transfer mode is
//! fixed per controller: SGL when both the configuration gate and the
//! controller allow it, PRP otherwise.

use std::rc::Rc;

use flint_block::{
    BlockDevice, BlockError, Direction, DiscardInfo, DmaTarget, InoutBlock, InoutFlags, IoCallback,
};

use crate::cmd::SglDesc;
use crate::error::NvmeError;
use crate::ns::Namespace;
use crate::queue::IOQ_SGLS;
use crate::PAGE_SIZE;

pub struct NvmeDisk {
    ns: Rc<Namespace>,
    hid: String,
}

impl NvmeDisk {
    /// Wraps an initialized namespace. The device identifier is
    /// `<controller serial>:n<nsid>`.
    pub fn new(ns: Rc<Namespace>) -> Self {
        let hid = format!("{}:n{}", ns.ctl().serial(), ns.nsid());
        Self { ns, hid }
    }

    pub fn namespace(&self) -> &Rc<Namespace> {
        &self.ns
    }
}

fn io_error(e: NvmeError) -> BlockError {
    match e {
        NvmeError::Busy => BlockError::Busy,
        NvmeError::UnsupportedTransfer => BlockError::Unsupported,
        _ => BlockError::Unsupported,
    }
}

fn completion(cb: IoCallback, bytes: usize) -> impl FnOnce(u16) {
    move |status| {
        cb(if status != 0 {
            Err(BlockError::Device { status })
        } else {
            Ok(bytes)
        })
    }
}

impl BlockDevice for NvmeDisk {
    fn hid(&self) -> &str {
        &self.hid
    }

    fn is_read_only(&self) -> bool {
        self.ns.read_only()
    }

    fn capacity(&self) -> u64 {
        self.ns.nsze() * self.ns.lba_size() as u64
    }

    fn sector_size(&self) -> usize {
        self.ns.lba_size()
    }

    fn max_size(&self) -> usize {
        let ctl = self.ns.ctl();
        if ctl.supports_sgl() {
            let mut max = 4 * 1024 * 1024;
            let mdts = ctl.mdts();
            if mdts != 0 && (mdts as u32) < usize::BITS {
                // Spread the device transfer limit evenly over the allowed
                // segments.
                let page = 1usize << (12 + ctl.cap().mpsmin());
                max = max.min((page << mdts) / IOQ_SGLS);
            }
            max
        } else {
            // Two PRP entries move one unaligned page worth of data.
            PAGE_SIZE
        }
    }

    fn max_segments(&self) -> usize {
        if self.ns.ctl().supports_sgl() {
            IOQ_SGLS
        } else {
            1
        }
    }

    fn discard_info(&self) -> DiscardInfo {
        DiscardInfo {
            max_discard_sectors: 0,
            max_discard_seg: 0,
            discard_sector_alignment: 0,
            max_write_zeroes_sectors: 65536,
            max_write_zeroes_seg: 1,
            write_zeroes_may_unmap: self.ns.dlfeat().deallocwz(),
        }
    }

    fn dma_map(
        &self,
        region: &dyn DmaTarget,
        offset: u64,
        num_sectors: usize,
        dir: Direction,
    ) -> flint_block::Result<u64> {
        self.ns
            .ctl()
            .dma()
            .map(region, offset, num_sectors * self.sector_size(), dir)
            .map_err(|_| BlockError::DmaMap)
    }

    fn dma_unmap(
        &self,
        paddr: u64,
        num_sectors: usize,
        dir: Direction,
    ) -> flint_block::Result<()> {
        self.ns
            .ctl()
            .dma()
            .unmap(paddr, num_sectors * self.sector_size(), dir)
            .map_err(|_| BlockError::DmaMap)
    }

    fn inout_data(
        &self,
        sector: u64,
        blocks: &InoutBlock,
        dir: Direction,
        cb: IoCallback,
    ) -> flint_block::Result<()> {
        if blocks.num_sectors == 0 {
            return Err(BlockError::Unsupported);
        }
        let read = dir == Direction::FromDevice;
        let sector_size = self.sector_size();

        let (io, sectors, segments) = if self.ns.ctl().supports_sgl() {
            let io = self.ns.prepare_rw_sgl(read, sector).map_err(io_error)?;
            let mut sectors = 0usize;
            let mut segments = 0usize;
            for b in blocks.iter().take(IOQ_SGLS) {
                self.ns.write_sgl(
                    io.cid(),
                    segments,
                    SglDesc::data(b.dma_addr, (b.num_sectors as usize * sector_size) as u32),
                );
                sectors += b.num_sectors as usize;
                segments += 1;
            }
            (io, sectors, segments)
        } else {
            // PRP fallback: a single segment, capped at what one PRP pair
            // can address.
            let sectors = (blocks.num_sectors as usize).min(self.max_size() / sector_size);
            let io = self
                .ns
                .prepare_rw_prp(read, sector, blocks.dma_addr, sectors * sector_size)
                .map_err(io_error)?;
            (io, sectors, 1)
        };

        let bytes = sectors * sector_size;
        self.ns
            .submit_rw(io, (sectors - 1) as u16, segments, Box::new(completion(cb, bytes)));
        Ok(())
    }

    fn flush(&self, cb: IoCallback) -> flint_block::Result<()> {
        // The volatile write cache is never enabled and there is no host
        // cache, so there is nothing to flush.
        cb(Ok(0));
        Ok(())
    }

    fn discard(
        &self,
        offset: u64,
        block: &InoutBlock,
        discard: bool,
        cb: IoCallback,
    ) -> flint_block::Result<()> {
        if discard {
            // True discard is not advertised; only write-zeroes is.
            return Err(BlockError::Unsupported);
        }
        debug_assert!(block.next.is_none(), "write-zeroes takes one segment");
        if block.num_sectors == 0 || block.num_sectors > 65536 {
            return Err(BlockError::Unsupported);
        }

        self.ns
            .write_zeroes(
                offset + block.sector,
                (block.num_sectors - 1) as u16,
                block.flags.contains(InoutFlags::UNMAP),
                Box::new(completion(cb, 0)),
            )
            .map_err(io_error)
    }
}

impl std::fmt::Debug for NvmeDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeDisk").field("hid", &self.hid).finish()
    }
}
