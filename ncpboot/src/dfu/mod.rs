//! Device side of the UART DFU bootloader.
//!
//! The pieces a bootloader image is built from, independent of any MCU:
//!
//! - [`flash`]: the [`FlashDevice`] capability and an in-memory flash.
//! - [`decoder`]: streaming EBL decoder that programs flash as chunks arrive.
//! - [`session`]: DFU command dispatcher and boot decision.
//! - [`ota`]: installation of an image staged in upper flash.
//! - [`server`]: one-packet-at-a-time serial command loop.

pub mod decoder;
pub mod flash;
pub mod ota;
pub mod server;
pub mod session;

pub use decoder::{EblDecoder, FeedReport};
pub use flash::{FlashDevice, FlashStats, MemFlash};
pub use ota::{OtaOutcome, install_staged_image};
pub use server::{ServeOutcome, announce, serve_once};
pub use session::{BootDecision, DfuSession, Handoff, Reply, SessionState};
