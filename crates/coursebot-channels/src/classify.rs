//! Transport error classification shared by the backends.

use coursebot_core::error::PollError;

/// Map a transport failure onto the session's recovery classes.
pub(crate) fn classify(e: reqwest::Error) -> PollError {
    if e.is_timeout() {
        PollError::ReadTimeout
    } else if let Some(status) = e.status() {
        PollError::ClientResponse {
            status: status.as_u16(),
        }
    } else if e.is_connect() || e.is_request() || e.is_body() {
        PollError::ConnectionReset(e.to_string())
    } else {
        PollError::Unexpected(e.to_string())
    }
}

/// Turn a non-success status into the matching poll error.
pub(crate) fn check_status(resp: &reqwest::Response) -> Result<(), PollError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(PollError::ClientResponse {
            status: status.as_u16(),
        })
    }
}
