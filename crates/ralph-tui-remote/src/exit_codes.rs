//! Exit codes for the `remote` CLI surface.

use crate::client::ClientError;
use crate::protocol::Payload;

/// Command succeeded.
pub const SUCCESS: i32 = 0;
/// Transport or protocol failure.
pub const TRANSPORT_FAILURE: i32 = 1;
/// Bad arguments.
pub const ARGUMENT_ERROR: i32 = 2;
/// The remote refused the operation (e.g. file exists without --force).
pub const REMOTE_REFUSED: i32 = 3;

/// Exit code for a finished `remote push-config` call.
#[must_use]
pub fn push_config_exit_code(result: &Result<Payload, ClientError>) -> i32 {
    match result {
        Ok(Payload::PushConfigResponse { success: true, .. }) => SUCCESS,
        Ok(Payload::PushConfigResponse { success: false, .. }) => REMOTE_REFUSED,
        Ok(_) | Err(_) => TRANSPORT_FAILURE,
    }
}
