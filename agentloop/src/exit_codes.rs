//! Stable exit codes for agentloop CLI commands.

use crate::core::types::{ExitStatus, Info};

/// Command succeeded, or the run finished by submission or environment completion.
pub const OK: i32 = 0;
/// Invalid config/instance/checkpoint input, or a fatal runtime failure.
pub const INVALID: i32 = 1;
/// The run finished through an `exit_*` sentinel.
pub const EXITED: i32 = 2;
/// The run was interrupted by the operator.
pub const INTERRUPTED: i32 = 130;

/// Exit code for a finished run's `info`.
pub fn for_info(info: &Info) -> i32 {
    let exited = info
        .exit_status
        .as_deref()
        .is_some_and(|status| ExitStatus::from_action(status).is_some());
    if exited { EXITED } else { OK }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_status_maps_to_exited() {
        let info = Info {
            exit_status: Some("exit_cost".to_string()),
            ..Info::default()
        };
        assert_eq!(for_info(&info), EXITED);

        let submitted = Info {
            exit_status: Some("submitted (exit_cost)".to_string()),
            ..Info::default()
        };
        assert_eq!(for_info(&submitted), OK);
        assert_eq!(for_info(&Info::default()), OK);
    }
}
