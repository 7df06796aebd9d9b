// Audio duplex — microphone to the realtime session, model speech to the speaker.

pub mod cpal_backend;
pub mod device;
pub mod downlink;
pub mod error;
pub mod pcm;
pub mod uplink;
