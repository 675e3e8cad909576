//! Status mapping shared by the REST-speaking adapters and providers.

use reqwest::{Response, StatusCode};
use strongbox_core::{KeyManagementError, ServiceError};

const MAX_ERROR_BODY: usize = 512;

pub(crate) fn transport_err(err: reqwest::Error) -> ServiceError {
    ServiceError::unavailable(format!("request failed: {err}"))
}

pub(crate) fn kms_transport_err(err: reqwest::Error) -> KeyManagementError {
    KeyManagementError::unreachable(format!("request failed: {err}"))
}

/// Pass through a successful storage response; 404 becomes `NotFound`,
/// anything else `Unavailable`.
pub(crate) async fn storage_response(resp: Response, key: &str) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ServiceError::not_found(key));
    }
    Err(ServiceError::unavailable(describe(resp).await))
}

/// Like `storage_response`, but a missing object counts as done.
pub(crate) async fn delete_response(resp: Response) -> Result<(), ServiceError> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    Err(ServiceError::unavailable(describe(resp).await))
}

/// Key-management responses: throttling, timeouts and server faults are
/// transient, any other refusal is final.
pub(crate) async fn kms_response(resp: Response) -> Result<Response, KeyManagementError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    let reason = describe(resp).await;
    if transient {
        Err(KeyManagementError::unreachable(reason))
    } else {
        Err(KeyManagementError::rejected(reason))
    }
}

async fn describe(resp: Response) -> String {
    let status = resp.status();
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    format!("status {status}: {}", body.trim())
}

/// Percent-encode an object name for use as a single path segment.
pub(crate) fn encode_segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

/// Percent-encode an object name but keep `/` separators.
pub(crate) fn encode_object_path(name: &str) -> String {
    name.split('/')
        .map(|part| urlencoding::encode(part).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
