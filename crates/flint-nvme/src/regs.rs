//! Controller register layout (NVMe Base Specification, Section 3.1).
//!
//! Bitfield views are plain newtypes over the raw register word with
//! shift/mask accessors; only the fields this driver actually uses are
//! exposed.

/// Controller Capabilities (64-bit).
pub const CAP: u32 = 0x00;
/// Version.
pub const VS: u32 = 0x08;
/// Interrupt Mask Set.
pub const INTMS: u32 = 0x0C;
/// Interrupt Mask Clear.
pub const INTMC: u32 = 0x10;
/// Controller Configuration.
pub const CC: u32 = 0x14;
/// Controller Status.
pub const CSTS: u32 = 0x1C;
/// Admin Queue Attributes.
pub const AQA: u32 = 0x24;
/// Admin Submission Queue Base Address (64-bit).
pub const ASQ: u32 = 0x28;
/// Admin Completion Queue Base Address (64-bit).
pub const ACQ: u32 = 0x30;

/// First doorbell register; the rest follow at the CAP.DSTRD stride.
pub const DOORBELL_BASE: u32 = 0x1000;

/// Queue id of the admin queue pair.
pub const ADMIN_QID: u16 = 0;

/// Tail doorbell of submission queue `qid`.
pub fn sq_tail_doorbell(qid: u16, dstrd: u8) -> u32 {
    DOORBELL_BASE + (2 * qid as u32) * (4 << dstrd)
}

/// Head doorbell of completion queue `qid`.
pub fn cq_head_doorbell(qid: u16, dstrd: u8) -> u32 {
    DOORBELL_BASE + (2 * qid as u32 + 1) * (4 << dstrd)
}

/// CAP register: Controller Capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cap(pub u64);

impl Cap {
    /// Maximum Queue Entries Supported (0-based).
    pub fn mqes(self) -> u16 {
        self.0 as u16
    }

    /// Doorbell stride exponent; register stride is `4 << dstrd` bytes.
    pub fn dstrd(self) -> u8 {
        ((self.0 >> 32) & 0xF) as u8
    }

    /// Command Sets Supported; bit 0 is the NVM command set.
    pub fn css(self) -> u8 {
        ((self.0 >> 37) & 0xFF) as u8
    }

    pub fn supports_nvm(self) -> bool {
        self.css() & 1 != 0
    }

    /// Memory Page Size Minimum, as an exponent offset from 4 KiB.
    pub fn mpsmin(self) -> u8 {
        ((self.0 >> 48) & 0xF) as u8
    }

    /// Memory Page Size Maximum, as an exponent offset from 4 KiB.
    pub fn mpsmax(self) -> u8 {
        ((self.0 >> 52) & 0xF) as u8
    }
}

/// CC register: Controller Configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cc(pub u32);

/// CC.AMS value for round-robin arbitration.
pub const AMS_RR: u8 = 0;
/// CC.CSS value selecting the NVM command set.
pub const CSS_NVM: u8 = 0;

impl Cc {
    pub fn set_en(&mut self, en: bool) {
        self.0 = (self.0 & !1) | en as u32;
    }

    /// I/O Command Set Selected (bits 4..6).
    pub fn set_css(&mut self, css: u8) {
        self.0 = (self.0 & !(0x7 << 4)) | ((css as u32 & 0x7) << 4);
    }

    /// Memory Page Size (bits 7..10), as `page_shift - 12`.
    pub fn set_mps(&mut self, mps: u8) {
        self.0 = (self.0 & !(0xF << 7)) | ((mps as u32 & 0xF) << 7);
    }

    /// Arbitration Mechanism Selected (bits 11..13).
    pub fn set_ams(&mut self, ams: u8) {
        self.0 = (self.0 & !(0x7 << 11)) | ((ams as u32 & 0x7) << 11);
    }

    /// I/O Submission Queue Entry Size (bits 16..19), as a power of two.
    pub fn set_iosqes(&mut self, v: u8) {
        self.0 = (self.0 & !(0xF << 16)) | ((v as u32 & 0xF) << 16);
    }

    /// I/O Completion Queue Entry Size (bits 20..23), as a power of two.
    pub fn set_iocqes(&mut self, v: u8) {
        self.0 = (self.0 & !(0xF << 20)) | ((v as u32 & 0xF) << 20);
    }
}

/// CSTS register: Controller Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csts(pub u32);

impl Csts {
    pub fn rdy(self) -> bool {
        self.0 & 1 != 0
    }

    /// Controller Fatal Status.
    pub fn cfs(self) -> bool {
        self.0 & 2 != 0
    }
}

/// AQA register: Admin Queue Attributes. Sizes are encoded 0-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aqa(pub u32);

impl Aqa {
    /// Admin Submission Queue Size (bits 0..11), 0-based.
    pub fn set_asqs(&mut self, entries_minus_one: u16) {
        self.0 = (self.0 & !0xFFF) | (entries_minus_one as u32 & 0xFFF);
    }

    /// Admin Completion Queue Size (bits 16..27), 0-based.
    pub fn set_acqs(&mut self, entries_minus_one: u16) {
        self.0 = (self.0 & !(0xFFF << 16)) | ((entries_minus_one as u32 & 0xFFF) << 16);
    }
}

/// VS register: Version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u32);

impl Version {
    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn tertiary(self) -> u8 {
        self.0 as u8
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.tertiary())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cap_field_extraction() {
        // MQES=127, DSTRD=2, CSS=NVM, MPSMIN=0, MPSMAX=4
        let cap = Cap(127 | (2u64 << 32) | (1u64 << 37) | (4u64 << 52));
        assert_eq!(cap.mqes(), 127);
        assert_eq!(cap.dstrd(), 2);
        assert!(cap.supports_nvm());
        assert_eq!(cap.mpsmin(), 0);
        assert_eq!(cap.mpsmax(), 4);
    }

    #[test]
    fn cc_composes_bringup_value() {
        let mut cc = Cc::default();
        cc.set_iocqes(4);
        cc.set_iosqes(6);
        cc.set_ams(AMS_RR);
        cc.set_mps(0);
        cc.set_css(CSS_NVM);
        cc.set_en(true);
        assert_eq!(cc.0, (4 << 20) | (6 << 16) | 1);
    }

    #[test]
    fn doorbell_offsets_follow_the_stride() {
        // DSTRD=0: 4-byte stride.
        assert_eq!(sq_tail_doorbell(0, 0), 0x1000);
        assert_eq!(cq_head_doorbell(0, 0), 0x1004);
        assert_eq!(sq_tail_doorbell(1, 0), 0x1008);
        assert_eq!(cq_head_doorbell(1, 0), 0x100C);
        // DSTRD=2: 16-byte stride.
        assert_eq!(sq_tail_doorbell(3, 2), 0x1000 + 6 * 16);
        assert_eq!(cq_head_doorbell(3, 2), 0x1000 + 7 * 16);
    }

    #[test]
    fn version_formats() {
        assert_eq!(Version(0x0001_0400).to_string(), "1.4.0");
    }
}
