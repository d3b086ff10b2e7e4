//! # ncpboot
//!
//! Serial firmware update for Silicon Labs EFM32/EFR32 parts.
//!
//! The crate covers both ends of the UART bootloader link:
//!
//! - EBL container parsing and the Application Address Table (AAT)
//! - A streaming EBL decoder that programs flash page by page
//! - The BGAPI UART DFU command set and its boot/OTA decisions
//! - Xmodem-CRC and BGAPI transfers from a host to a device
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ncpboot::{Aat, Ebl};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ebl = Ebl::from_file("app.ebl")?;
//!     println!("{} records, {} program bytes", ebl.records.len(), ebl.program_bytes());
//!
//!     if let Some(first) = ebl.records.iter().find(|r| !r.data().is_empty()) {
//!         let aat = Aat::parse(first.data())?;
//!         println!("image type: {}", aat.image_type_name());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootload;
pub mod device;
pub mod dfu;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running transfers.
///
/// The checker returns `true` when the current operation should stop, for
/// example after Ctrl-C in the CLI. Only the first registration sticks.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    bootload::{
        BootloadOptions, BootloaderLink, MenuLink, PassiveLink, PercentageReporter,
        TransferProtocol, WHOLE_FILE, bootload_image,
    },
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    dfu::{BootDecision, DfuSession, EblDecoder, FlashDevice, MemFlash, OtaOutcome},
    error::{Error, Result},
    image::{Aat, Ebl, EblRecord, EblTag, PageRange},
    port::{FlowControl, Port, SerialConfig},
    protocol::{DfuClient, DfuCommand, DfuEvent, XmodemConfig, XmodemSender},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
