//! Resource hooks driven by informer state changes

pub mod cpuset;
pub mod protocol;
