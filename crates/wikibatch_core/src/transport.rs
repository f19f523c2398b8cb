use crate::error::ApiResult;
use crate::reply::Reply;

/// Ordered request parameters.
pub type Params = Vec<(String, String)>;

/// One HTTP round-trip against the wiki API.
///
/// Implementations return `Ok` for any decodable body, including bodies that
/// carry an API `error` object; callers decide how to classify those through
/// [`Reply::into_result`]. Network, HTTP status and decode failures are `Err`.
pub trait Transport: Send + Sync {
    fn get(&self, params: &[(String, String)]) -> ApiResult<Reply>;

    fn post(&self, params: &[(String, String)]) -> ApiResult<Reply>;

    fn multipart_post(
        &self,
        params: &[(String, String)],
        filename: &str,
        bytes: Vec<u8>,
    ) -> ApiResult<Reply>;

    fn request_count(&self) -> usize {
        0
    }
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

/// Insert or replace `key` while keeping its original position.
pub fn set_param(params: &mut Params, key: &str, value: impl Into<String>) {
    let value = value.into();
    match params.iter_mut().find(|(existing, _)| existing == key) {
        Some(entry) => entry.1 = value,
        None => params.push((key.to_string(), value)),
    }
}

pub fn get_param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(existing, _)| existing == key)
        .map(|(_, value)| value.as_str())
}
