//! Virtualization layer: CLI-backed VM control, guest command construction,
//! and the exclusivity pool.
//!
//! ## Sub-modules
//!
//! - [`controller`] — one-shot `VBoxManage` wrapper: power, snapshot,
//!   status, guest transfer/exec, and the merged cleanup primitive
//! - [`guest`] — typed PowerShell command builder and stdout interpretation
//! - [`pool`] — exclusive-lease ledger over the configured VMs

pub mod controller;
pub mod guest;
pub mod pool;

pub use controller::{
    CliOutput, CliRunner, GuestExec, PowerState, StartMode, VBoxManageController, VmController,
    VmStatus,
};
pub use guest::{GuestCommand, GuestOps};
pub use pool::{PoolSnapshot, VmLease, VmPool};
