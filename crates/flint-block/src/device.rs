use std::any::Any;

use bitflags::bitflags;

use crate::error::Result;

/// DMA transfer direction, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host memory is read by the device (writes, submission rings).
    ToDevice,
    /// Host memory is written by the device (reads, completion rings).
    FromDevice,
}

bitflags! {
    /// Per-segment request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InoutFlags: u32 {
        /// For discard requests: the blocks may be unmapped rather than
        /// merely zeroed.
        const UNMAP = 1 << 0;
    }
}

impl Default for InoutFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One segment of a client I/O request, already mapped for device access.
///
/// Requests with multiple segments chain them through `next`; drivers that
/// only support a single segment per command ignore the tail.
#[derive(Debug, Default)]
pub struct InoutBlock {
    /// Bus address of the segment, as returned by `BlockDevice::dma_map`.
    pub dma_addr: u64,
    /// Sector offset of this segment relative to the request start.
    pub sector: u64,
    /// Segment length in device sectors.
    pub num_sectors: u32,
    pub flags: InoutFlags,
    pub next: Option<Box<InoutBlock>>,
}

impl InoutBlock {
    /// Iterates over this segment and all chained successors.
    pub fn iter(&self) -> impl Iterator<Item = &InoutBlock> {
        let mut cur = Some(self);
        std::iter::from_fn(move || {
            let b = cur.take()?;
            cur = b.next.as_deref();
            Some(b)
        })
    }
}

/// Completion callback for an asynchronous device request.
///
/// Receives the number of bytes transferred on success and the device status
/// on failure. Invoked exactly once, from the driver's completion path.
pub type IoCallback = Box<dyn FnOnce(Result<usize>)>;

/// Invoked by the manager once a newly added disk is visible to clients.
pub type ReadyCallback = Box<dyn FnOnce()>;

/// Discard/write-zeroes capabilities of a device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardInfo {
    pub max_discard_sectors: u32,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_write_zeroes_seg: u32,
    pub write_zeroes_may_unmap: bool,
}

/// An opaque client memory region that can be mapped for device DMA.
///
/// The concrete representation belongs to the memory facility (a dataspace,
/// a pinned allocation, ...); drivers pass it through to their DMA space
/// untouched.
pub trait DmaTarget {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;
}

/// Driver-side surface of one disk, consumed by the block-device manager.
pub trait BlockDevice {
    /// Stable identifier clients use to select this disk.
    fn hid(&self) -> &str;

    fn match_hid(&self, hid: &str) -> bool {
        self.hid() == hid
    }

    fn is_read_only(&self) -> bool;

    /// Total capacity in bytes.
    fn capacity(&self) -> u64;

    /// Sector size in bytes.
    fn sector_size(&self) -> usize;

    /// Maximum bytes per request.
    fn max_size(&self) -> usize;

    /// Maximum number of segments per request.
    fn max_segments(&self) -> usize;

    fn discard_info(&self) -> DiscardInfo;

    /// Maps `num_sectors` worth of a client region for device access.
    fn dma_map(
        &self,
        region: &dyn DmaTarget,
        offset: u64,
        num_sectors: usize,
        dir: Direction,
    ) -> Result<u64>;

    fn dma_unmap(&self, paddr: u64, num_sectors: usize, dir: Direction) -> Result<()>;

    /// Starts a read or write covering `blocks`, beginning at `sector`.
    ///
    /// Returns [`BlockError::Busy`] when the device queue is full; the
    /// request was not accepted and may be retried after a completion.
    fn inout_data(
        &self,
        sector: u64,
        blocks: &InoutBlock,
        dir: Direction,
        cb: IoCallback,
    ) -> Result<()>;

    /// Flushes volatile device state, if any.
    fn flush(&self, cb: IoCallback) -> Result<()>;

    /// Discards (`discard == true`) or zeroes a range of blocks.
    fn discard(&self, offset: u64, block: &InoutBlock, discard: bool, cb: IoCallback)
        -> Result<()>;
}

/// Client-facing manager that accepts discovered disks.
pub trait DiskManager {
    /// Hands a disk over to the manager. `on_ready` fires once the disk is
    /// visible to clients.
    fn add_disk(&mut self, device: Box<dyn BlockDevice>, on_ready: ReadyCallback);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(segs: &[(u64, u32)]) -> InoutBlock {
        let mut head: Option<Box<InoutBlock>> = None;
        for &(dma_addr, num_sectors) in segs.iter().rev() {
            head = Some(Box::new(InoutBlock {
                dma_addr,
                num_sectors,
                next: head,
                ..Default::default()
            }));
        }
        *head.unwrap()
    }

    #[test]
    fn inout_block_iterates_chain_in_order() {
        let blocks = chain(&[(0xA000, 8), (0xB000, 4), (0xC000, 1)]);
        let got: Vec<_> = blocks.iter().map(|b| (b.dma_addr, b.num_sectors)).collect();
        assert_eq!(got, vec![(0xA000, 8), (0xB000, 4), (0xC000, 1)]);
    }

    #[test]
    fn unmap_flag_roundtrip() {
        let b = InoutBlock {
            flags: InoutFlags::UNMAP,
            ..Default::default()
        };
        assert!(b.flags.contains(InoutFlags::UNMAP));
        assert!(!InoutBlock::default().flags.contains(InoutFlags::UNMAP));
    }
}
