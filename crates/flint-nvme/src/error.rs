use thiserror::Error;

use crate::hw::HwError;

pub type Result<T> = std::result::Result<T, NvmeError>;

#[derive(Debug, Error)]
pub enum NvmeError {
    /// CAP.CSS does not advertise the NVM command set.
    #[error("controller does not support the NVM command set")]
    NoNvmCommandSet,

    /// The host page size falls outside the controller's supported window.
    #[error("host page size outside controller bounds (mpsmin={mpsmin}, mpsmax={mpsmax})")]
    UnsupportedPageSize { mpsmin: u8, mpsmax: u8 },

    /// The submission queue has no usable slot; retry after a completion.
    #[error("submission queue full")]
    Busy,

    /// The data buffer would need a PRP list (spans more than two pages).
    #[error("data buffer spans more than two physical pages")]
    UnsupportedTransfer,

    #[error(transparent)]
    Hw(#[from] HwError),
}
