//! Collaborator seams consumed by the NVMe core.
//!
//! The core never talks to the PCI bus, MMIO, DMA memory or the interrupt
//! controller directly; it goes through the traits below. A real server
//! wires these to its platform facilities, the tests in this repository wire
//! them to in-process doubles ([`TestRegisterBlock`], [`TestDmaSpace`]).

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use thiserror::Error;

use flint_block::{Direction, DmaTarget};

use crate::dma::DmaBuffer;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("dma allocation of {0} bytes failed")]
    DmaAlloc(usize),

    #[error("dma map failed")]
    DmaMap,

    #[error("pci config space access failed")]
    ConfigSpace,

    #[error("mmio mapping failed")]
    Mmio,

    #[error("interrupt setup failed: {0}")]
    Interrupt(&'static str),
}

/// Interrupt trigger mode of the bound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTrigger {
    /// Level-triggered: the line must be unmasked again after each
    /// dispatched interrupt.
    Level,
    /// Edge-triggered: unmasking once at registration time suffices.
    Edge,
}

/// Result of enabling a PCI function's interrupt.
#[derive(Debug, Clone, Copy)]
pub struct IrqInfo {
    /// Interrupt number to bind at the interrupt controller.
    pub irq: u32,
    pub trigger: IrqTrigger,
}

/// A 32-bit MMIO register window (BAR0 of the controller).
///
/// 64-bit registers are accessed as two 32-bit words, low word first, the
/// only access width the register block guarantees. Implementations must
/// perform each access exactly once and in order (no merging, no
/// speculation).
pub trait RegisterBlock {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);

    fn read64(&self, offset: u32) -> u64 {
        (self.read32(offset) as u64) | ((self.read32(offset + 4) as u64) << 32)
    }

    fn write64(&self, offset: u32, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// One PCI function, as handed out by the (external) bus enumerator.
pub trait PciFunction {
    fn config_read32(&self, offset: u32) -> std::result::Result<u32, HwError>;
    fn config_read16(&self, offset: u32) -> std::result::Result<u16, HwError>;
    fn config_write16(&self, offset: u32, value: u16) -> std::result::Result<(), HwError>;

    /// Maps the register BAR as uncached MMIO.
    fn map_registers(&self, bar: u64) -> std::result::Result<Rc<dyn RegisterBlock>, HwError>;

    /// Enables the function's interrupt and reports its number and trigger
    /// mode.
    fn enable_interrupt(&self) -> std::result::Result<IrqInfo, HwError>;
}

/// A bound hardware interrupt line.
pub trait IrqHandle {
    fn unmask(&self);
}

/// The platform interrupt controller.
pub trait IrqController {
    /// Binds `irq` so its firings are delivered to the server loop, which
    /// dispatches them to `Controller::handle_irq`.
    fn bind(&self, irq: u32) -> std::result::Result<Rc<dyn IrqHandle>, HwError>;
}

/// DMA memory facility: coherent allocations for rings and command
/// payloads, plus map/unmap of client-owned regions.
pub trait DmaSpace {
    /// Allocates a zeroed, DMA-coherent, uncached region.
    fn alloc(&self, len: usize, dir: Direction) -> std::result::Result<Rc<DmaBuffer>, HwError>;

    /// Maps a client region for device access, returning its bus address.
    fn map(
        &self,
        target: &dyn DmaTarget,
        offset: u64,
        len: usize,
        dir: Direction,
    ) -> std::result::Result<u64, HwError>;

    fn unmap(&self, paddr: u64, len: usize, dir: Direction)
        -> std::result::Result<(), HwError>;
}

// ---------------------------------------------------------------------------
// In-process doubles, shared by the unit and integration tests.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestRegisterBlockState {
    regs: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
}

/// A register file double that records every write in order.
#[derive(Clone, Default)]
pub struct TestRegisterBlock(Rc<RefCell<TestRegisterBlockState>>);

impl TestRegisterBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets a 32-bit register value.
    pub fn set_reg32(&self, offset: u32, value: u32) {
        self.0.borrow_mut().regs.insert(offset, value);
    }

    /// Presets a 64-bit register as two 32-bit words.
    pub fn set_reg64(&self, offset: u32, value: u64) {
        self.set_reg32(offset, value as u32);
        self.set_reg32(offset + 4, (value >> 32) as u32);
    }

    /// All writes performed so far, in order.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.0.borrow().writes.clone()
    }

    pub fn last_write(&self, offset: u32) -> Option<u32> {
        self.0
            .borrow()
            .writes
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
    }
}

impl RegisterBlock for TestRegisterBlock {
    fn read32(&self, offset: u32) -> u32 {
        self.0.borrow().regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.0.borrow_mut();
        state.regs.insert(offset, value);
        state.writes.push((offset, value));
    }
}

struct HeapAlloc {
    ptr: NonNull<u8>,
    layout: std::alloc::Layout,
}

// The allocation is only touched through `DmaBuffer`'s accessors.
unsafe impl Send for HeapAlloc {}

impl Drop for HeapAlloc {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A DMA space double backed by page-aligned heap allocations.
///
/// Bus addresses are the host virtual addresses of the allocations, so a
/// device double can reach the same bytes by dereferencing the "physical"
/// address it is given. Client-region map/unmap calls are recorded and
/// resolved the same way.
#[derive(Clone, Default)]
pub struct TestDmaSpace {
    maps: Rc<RefCell<Vec<(u64, usize, Direction)>>>,
    unmaps: Rc<RefCell<Vec<(u64, usize, Direction)>>>,
}

impl TestDmaSpace {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn mapped(&self) -> Vec<(u64, usize, Direction)> {
        self.maps.borrow().clone()
    }

    pub fn unmapped(&self) -> Vec<(u64, usize, Direction)> {
        self.unmaps.borrow().clone()
    }
}

/// A client memory region double for `DmaSpace::map`.
pub struct TestRegion(pub Vec<u8>);

impl DmaTarget for TestRegion {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DmaSpace for TestDmaSpace {
    fn alloc(&self, len: usize, dir: Direction) -> std::result::Result<Rc<DmaBuffer>, HwError> {
        let len = crate::round_page(len.max(1));
        let layout = std::alloc::Layout::from_size_align(len, crate::PAGE_SIZE)
            .map_err(|_| HwError::DmaAlloc(len))?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(HwError::DmaAlloc(len))?;
        let paddr = ptr.as_ptr() as u64;

        let unmaps = self.unmaps.clone();
        Ok(Rc::new(DmaBuffer::new(
            ptr,
            len,
            paddr,
            dir,
            Box::new(HeapAlloc { ptr, layout }),
            Some(Box::new(move |paddr, len, dir| {
                unmaps.borrow_mut().push((paddr, len, dir));
            })),
        )))
    }

    fn map(
        &self,
        target: &dyn DmaTarget,
        offset: u64,
        len: usize,
        dir: Direction,
    ) -> std::result::Result<u64, HwError> {
        if offset as usize + len > target.len() {
            return Err(HwError::DmaMap);
        }
        let region = target
            .as_any()
            .downcast_ref::<TestRegion>()
            .ok_or(HwError::DmaMap)?;
        let paddr = region.0.as_ptr() as u64 + offset;
        self.maps.borrow_mut().push((paddr, len, dir));
        Ok(paddr)
    }

    fn unmap(
        &self,
        paddr: u64,
        len: usize,
        dir: Direction,
    ) -> std::result::Result<(), HwError> {
        self.unmaps.borrow_mut().push((paddr, len, dir));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_double_records_writes_in_order() {
        let regs = TestRegisterBlock::new();
        regs.write32(0x14, 0);
        regs.write32(0x24, 0x0001_0001);
        regs.write64(0x28, 0xAABB_CCDD_0000_1000);

        assert_eq!(
            regs.writes(),
            vec![
                (0x14, 0),
                (0x24, 0x0001_0001),
                (0x28, 0x0000_1000),
                (0x2C, 0xAABB_CCDD),
            ]
        );
        assert_eq!(regs.read64(0x28), 0xAABB_CCDD_0000_1000);
    }

    #[test]
    fn dma_double_allocates_page_aligned_zeroed() {
        let dma = TestDmaSpace::new();
        let buf = dma.alloc(100, Direction::FromDevice).unwrap();
        assert_eq!(buf.len(), crate::PAGE_SIZE);
        assert_eq!(buf.paddr(0) % crate::PAGE_SIZE as u64, 0);
        assert_eq!(buf.read_volatile::<u64>(0), 0);
        assert_eq!(buf.read_volatile::<u8>(crate::PAGE_SIZE - 1), 0);
    }

    #[test]
    fn dma_buffer_unmap_reported_once() {
        let dma = TestDmaSpace::new();
        let buf = dma.alloc(crate::PAGE_SIZE, Direction::FromDevice).unwrap();
        let paddr = buf.paddr(0);
        buf.unmap();
        drop(buf);
        assert_eq!(
            dma.unmapped(),
            vec![(paddr, crate::PAGE_SIZE, Direction::FromDevice)]
        );
    }
}
