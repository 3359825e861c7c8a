mod error;
mod layout;
mod reader;
mod ring;
mod seqlock;
mod writer;

pub use error::ColumnarError;
pub use layout::{
    HEADER_SIZE, Header, LayoutError, ROW_BYTES, TickerIndex, TickerLayout, compute_layout,
};
pub use reader::{Bars, ColumnarReader, DEFAULT_MAX_RETRIES};
pub use ring::{advance, ring_slice, window_start};
pub use writer::ColumnarWriter;
