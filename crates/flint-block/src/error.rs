use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The device cannot accept the request right now; retry after an
    /// outstanding request completes.
    #[error("device busy, retry later")]
    Busy,

    /// The request can never succeed in this shape (unsupported transfer
    /// geometry or operation).
    #[error("operation not supported by this device")]
    Unsupported,

    /// The device rejected or failed the command; `status` is the raw
    /// device status field.
    #[error("device reported status {status:#06x}")]
    Device { status: u16 },

    /// Mapping client memory for device access failed.
    #[error("dma mapping failed")]
    DmaMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_format_for_logs() {
        assert_eq!(
            BlockError::Device { status: 0x2002 }.to_string(),
            "device reported status 0x2002"
        );
        assert_eq!(BlockError::Busy.to_string(), "device busy, retry later");
    }
}
