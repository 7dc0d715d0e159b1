//! Shared-resource identifiers.
//!
//! Peripherals physically reachable from both cores; exclusive use is
//! arbitrated by the cross-core resource lock.

/// Shared general-purpose DMA engine.
pub const DMA0: u16 = 0;

/// Shared audio sample FIFO.
pub const AUDIO_FIFO: u16 = 1;

/// Shared QSPI controller (flash access).
pub const QSPI: u16 = 2;

/// Crypto accelerator block.
pub const CRYPTO: u16 = 3;

/// Number of arbitrated resources on the TM7.
pub const RESOURCE_COUNT: u16 = 4;
