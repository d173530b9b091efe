//! Process-level helpers shared by binaries and broker backends.

pub mod bootstrap;
pub mod retry;
