//! Shared traits

mod transport;

pub use transport::FrameTransport;
