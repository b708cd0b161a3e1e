use crate::error::RdirError;
use uuid::Uuid;

/// Header carrying the request-correlation id on every outbound call.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Generates a request-correlation id for calls where the caller did not
/// supply one.
pub fn request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Maps a non-2xx proxy/rdir answer to an application-level error carrying
/// the status and the response body.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, RdirError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(RdirError::Status {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
pub fn init_logging(level: LevelFilter) {
    let _ = env_logger::builder()
        .filter_level(level)
        .is_test(true)
        .try_init();
}
