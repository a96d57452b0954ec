//! All the architecture specific modules.
//!
//! Only ARM is implemented; the ADIv5 stack and the Cortex-M run control
//! live under [`arm`].

pub mod arm;
