use basalt_mmap::RegionError;

use crate::layout::LayoutError;

#[derive(Debug, thiserror::Error)]
pub enum ColumnarError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("unknown ticker '{0}'")]
    UnknownTicker(String),

    #[error("region is {actual} bytes but the ticker index needs {expected}")]
    RegionTooSmall { expected: usize, actual: usize },

    #[error("ticker '{ticker}' header capacity {found} does not match index capacity {expected}")]
    LayoutMismatch {
        ticker: String,
        expected: u64,
        found: u64,
    },

    #[error("no consistent read of '{ticker}' after {attempts} attempts")]
    Unstable { ticker: String, attempts: u32 },
}
