//! Driver core for devices speaking the AT command set over a serial channel.
//!
//! The crate is split into a pure, byte-fed line parser ([`parser`]) and an
//! async command dispatcher ([`channel`]) that owns the parser via a
//! background reader task. Callers issue a command and get the modem's
//! multi-line response back; unsolicited result codes arriving at any time
//! are routed to a separate queue.
#![no_std]

pub mod channel;
pub mod error;
pub mod parser;
pub mod response;
pub mod scan;

pub type Result<T> = core::result::Result<T, error::Error>;

#[cfg(all(target_abi = "eabihf", target_os = "none"))]
pub type RawMutex = embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
#[cfg(not(all(target_abi = "eabihf", target_os = "none")))]
pub type RawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
