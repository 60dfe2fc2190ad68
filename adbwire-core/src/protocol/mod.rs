//! Device-side sub-protocol engines.
//!
//! Each engine takes over a device-bound [`AdbConnection`] and drives its
//! sub-protocol until the caller is done with it. A connection never leaves
//! the sub-protocol it entered.
//!
//! [`AdbConnection`]: crate::network::AdbConnection

pub mod shell;
pub mod sync;

pub use shell::{ShellOptions, ShellProtocol, ShellStream, run_shell};
pub use sync::SyncSession;
