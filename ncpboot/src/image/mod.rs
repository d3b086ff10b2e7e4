//! Firmware image formats.
//!
//! - [`ebl`]: the EBL record container carried over the wire.
//! - [`aat`]: the Application Address Table at the head of a flashed image.

pub mod aat;
pub mod ebl;

pub use aat::{Aat, PageRange};
pub use ebl::{Ebl, EblRecord, EblTag};
