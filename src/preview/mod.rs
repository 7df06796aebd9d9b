// Preview pipeline — frame capture, fan-out, and JPEG encoding.

pub mod capture;
pub mod compress;
pub mod consumer;
pub mod convert;
pub mod surface;
