// Camera domain — discovery, lens geometry, and the hardware seam.

pub mod backend;
pub mod dummy;
pub mod endpoint;
pub mod error;
pub mod oneshot;
pub mod types;
