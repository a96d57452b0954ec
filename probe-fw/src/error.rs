use crate::architecture::arm::ArmError;
use crate::flashing::FlashError;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An ARM debug interface specific error occurred.
    #[error("An ARM debug interface specific error occurred")]
    Arm(#[from] ArmError),
    /// A flash programming error occurred.
    #[error("A flash programming error occurred")]
    Flash(#[from] FlashError),
    /// The scan finished without finding a target the firmware knows how
    /// to drive.
    #[error("NO TARGETS.")]
    NoTargets,
    /// The target with the given number does not exist.
    #[error("Target {0} does not exist")]
    TargetNotFound(usize),
    /// A `monitor` command was not recognized by the current target.
    #[error("Unknown monitor command '{0}'")]
    UnknownMonitorCommand(String),
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
