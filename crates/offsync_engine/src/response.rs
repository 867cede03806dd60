//! Classification of backend responses.

use crate::transport::HttpResponse;
use offsync_core::{AuthFailure, DataStoreError, DataStoreResult};
use serde_json::Value;

/// Parses a response body as JSON, mapping error statuses to errors.
///
/// # Errors
///
/// Returns the classified error for non-2xx statuses and
/// `InvalidResponse` if a 2xx body is not JSON.
pub fn parse_json(response: &HttpResponse) -> DataStoreResult<Value> {
    if !response.is_success() {
        return Err(classify_error(response));
    }
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body)
        .map_err(|err| DataStoreError::invalid_response(response.status, err.to_string()))
}

/// Parses a response whose body is an array of records.
///
/// # Errors
///
/// Same as [`parse_json`], plus `InvalidResponse` if the body is not an array.
pub fn parse_records(response: &HttpResponse) -> DataStoreResult<Vec<Value>> {
    match parse_json(response)? {
        Value::Array(records) => Ok(records),
        other => Err(DataStoreError::invalid_response(
            response.status,
            format!("expected an array of records, got {other}"),
        )),
    }
}

/// Parses a `{"count": n}` response.
///
/// # Errors
///
/// Same as [`parse_json`], plus `InvalidResponse` if `count` is missing.
pub fn parse_count(response: &HttpResponse) -> DataStoreResult<u64> {
    count_of(&parse_json(response)?).ok_or_else(|| {
        DataStoreError::invalid_response(response.status, "missing count in response")
    })
}

/// Reads the `count` field of a parsed body.
pub fn count_of(body: &Value) -> Option<u64> {
    body.get("count").and_then(Value::as_u64)
}

/// Maps an error response to a [`DataStoreError`].
pub fn classify_error(response: &HttpResponse) -> DataStoreError {
    let status = response.status;
    let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
        return DataStoreError::invalid_response(
            status,
            String::from_utf8_lossy(&response.body).into_owned(),
        );
    };
    let Some(code) = body.get("error").and_then(Value::as_str) else {
        return DataStoreError::UnknownServerError {
            status,
            body: body.to_string(),
        };
    };

    let text = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let debug = text("debug");
    let description = text("description");

    match (status, code) {
        (401, _) => DataStoreError::unauthorized(AuthFailure::from_code(code), debug, description),
        (404, "DataLinkEntityNotFound") => {
            DataStoreError::DataLinkEntityNotFound { debug, description }
        }
        (404, "EntityNotFound") => DataStoreError::EntityNotFound { description },
        (404, "AppNotFound") => DataStoreError::AppNotFound { description },
        (405, _) => DataStoreError::MethodNotAllowed { debug, description },
        (403, "MissingConfiguration") => {
            DataStoreError::MissingConfiguration { debug, description }
        }
        (403, _) => DataStoreError::Forbidden { description },
        (400, "ResultSetSizeExceeded") => {
            DataStoreError::ResultSetSizeExceeded { debug, description }
        }
        _ => DataStoreError::UnknownServerError {
            status,
            body: body.to_string(),
        },
    }
}
