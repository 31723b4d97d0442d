//! File formats understood by the array loader.

pub mod npy;

pub use npy::{save_npy, MmapMode, NpyHeader, NpyReader};
