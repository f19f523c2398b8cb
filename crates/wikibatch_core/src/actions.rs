//! Mutating actions (edit, delete, undelete) and the retry policy they share
//! with chunk uploads.

use std::thread::sleep;

use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::reply::Reply;
use crate::session::Session;
use crate::transport::params;

/// Run `attempt` with a CSRF token until it succeeds or the policy gives up.
///
/// Rate limiting sleeps before the next attempt, a rejected token is
/// refreshed single-flight, protected or missing targets fail at once, and
/// anything else is retried immediately.
pub fn with_retry<F>(
    session: &Session,
    max_attempts: usize,
    label: &str,
    mut attempt: F,
) -> ApiResult<Reply>
where
    F: FnMut(&str) -> ApiResult<Reply>,
{
    let policy = &session.settings().retry;
    let max_attempts = max_attempts.max(1);
    let mut token = session.csrf_token()?;
    let mut last_error = None;

    for attempt_number in 1..=max_attempts {
        let error = match attempt(&token).and_then(Reply::into_result) {
            Ok(reply) => return Ok(reply),
            Err(error) => error,
        };
        let has_more = attempt_number < max_attempts;
        match error.kind() {
            ErrorKind::Protected | ErrorKind::NotFound | ErrorKind::Io => {
                debug!(label, error = %error, "action failed without retry");
                return Err(error);
            }
            ErrorKind::RateLimited => {
                warn!(label, attempt = attempt_number, "rate limited");
                if has_more {
                    sleep(policy.rate_limit_backoff);
                }
            }
            ErrorKind::BadToken => {
                warn!(label, attempt = attempt_number, "csrf token rejected");
                if has_more {
                    token = session.refresh_csrf_token(Some(&token))?;
                }
            }
            _ => warn!(label, attempt = attempt_number, error = %error, "retrying action"),
        }
        last_error = Some(error);
    }

    Err(last_error.unwrap_or_else(|| {
        ApiError::Transport(format!("{label} exhausted its retry budget"))
    }))
}

pub fn edit(session: &Session, title: &str, text: &str, summary: &str) -> ApiResult<Reply> {
    let max_attempts = session.settings().retry.max_attempts;
    let reply = with_retry(session, max_attempts, "edit", |token| {
        session.transport().post(&params(&[
            ("action", "edit"),
            ("title", title),
            ("text", text),
            ("summary", summary),
            ("bot", "1"),
            ("token", token),
        ]))
    })?;
    match reply.str_at("/edit/result") {
        Some("Success") => Ok(reply),
        other => Err(ApiError::Api {
            code: "editfailed".to_string(),
            info: format!("edit of {title} returned {}", other.unwrap_or("no result")),
        }),
    }
}

pub fn delete(session: &Session, title: &str, reason: &str) -> ApiResult<Reply> {
    let max_attempts = session.settings().retry.max_attempts;
    with_retry(session, max_attempts, "delete", |token| {
        session.transport().post(&params(&[
            ("action", "delete"),
            ("title", title),
            ("reason", reason),
            ("token", token),
        ]))
    })
}

pub fn undelete(session: &Session, title: &str, reason: &str) -> ApiResult<Reply> {
    let max_attempts = session.settings().retry.max_attempts;
    with_retry(session, max_attempts, "undelete", |token| {
        session.transport().post(&params(&[
            ("action", "undelete"),
            ("title", title),
            ("reason", reason),
            ("token", token),
        ]))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::mock::{self, MockTransport, token_reply};

    const BACKOFF: Duration = Duration::from_millis(200);

    #[test]
    fn edit_succeeds_on_first_attempt() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            assert_eq!(call.param("token"), Some("abc+\\"));
            assert_eq!(call.param("bot"), Some("1"));
            Ok(json!({"edit": {"result": "Success", "newrevid": 7}}))
        }));
        let session = mock::session(transport.clone());
        let reply = edit(&session, "Alpha", "body", "summary").expect("edit");
        assert_eq!(reply.i64_at("/edit/newrevid"), Some(7));
        assert_eq!(transport.calls_with_action("edit").len(), 1);
    }

    #[test]
    fn rate_limited_edit_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let transport = Arc::new(MockTransport::new(move |call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(json!({"error": {"code": "ratelimited", "info": "slow down"}}));
            }
            Ok(json!({"edit": {"result": "Success"}}))
        }));
        let session = mock::session(transport.clone());
        edit(&session, "Alpha", "body", "summary").expect("edit");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rate_limit_sleeps_for_the_backoff_before_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let transport = Arc::new(MockTransport::new(move |call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(json!({"error": {"code": "ratelimited", "info": "slow down"}}));
            }
            Ok(json!({"edit": {"result": "Success"}}))
        }));
        let session = mock::session_with_backoff(transport, BACKOFF);
        let started = Instant::now();
        edit(&session, "Alpha", "body", "summary").expect("edit");
        assert!(started.elapsed() >= BACKOFF);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn generic_errors_retry_without_sleeping() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            Err(ApiError::Transport("reset".to_string()))
        }));
        let session = mock::session_with_backoff(transport.clone(), BACKOFF);
        let started = Instant::now();
        delete(&session, "Alpha", "cleanup").expect_err("must fail");
        assert!(started.elapsed() < BACKOFF);
        assert_eq!(transport.calls_with_action("delete").len(), 3);
    }

    #[test]
    fn protected_page_fails_without_retry() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            Ok(json!({"error": {"code": "protectedpage", "info": "protected"}}))
        }));
        let session = mock::session(transport.clone());
        let error = edit(&session, "Main Page", "x", "y").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Protected);
        assert_eq!(transport.calls_with_action("edit").len(), 1);
    }

    #[test]
    fn generic_errors_retry_up_to_policy_limit() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            Err(ApiError::Transport("reset".to_string()))
        }));
        let session = mock::session(transport.clone());
        let error = delete(&session, "Alpha", "cleanup").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Transport);
        assert_eq!(
            transport.calls_with_action("delete").len(),
            session.settings().retry.max_attempts
        );
    }

    #[test]
    fn bad_token_is_refreshed_then_retried() {
        let token_fetches = Arc::new(AtomicUsize::new(0));
        let fetches = token_fetches.clone();
        let transport = Arc::new(MockTransport::new(move |call| {
            if call.is_token_request() {
                let n = fetches.fetch_add(1, Ordering::SeqCst);
                return Ok(json!({"query": {"tokens": {"csrftoken": format!("t{n}")}}}));
            }
            if call.param("token") == Some("t0") {
                return Ok(json!({"error": {"code": "badtoken", "info": "Invalid CSRF token."}}));
            }
            Ok(json!({"undelete": {"title": "Alpha", "revisions": 3}}))
        }));
        let session = mock::session(transport.clone());
        undelete(&session, "Alpha", "restore").expect("undelete");
        assert_eq!(token_fetches.load(Ordering::SeqCst), 2);
        let calls = transport.calls_with_action("undelete");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].param("token"), Some("t1"));
    }

    #[test]
    fn missing_page_delete_is_not_found() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            Ok(json!({"error": {"code": "missingtitle", "info": "The page you specified doesn't exist."}}))
        }));
        let session = mock::session(transport);
        let error = delete(&session, "Ghost", "cleanup").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn edit_without_success_result_is_an_error() {
        let transport = Arc::new(MockTransport::new(|call| {
            if call.is_token_request() {
                return Ok(token_reply());
            }
            Ok(json!({"edit": {"result": "Failure", "captcha": {}}}))
        }));
        let session = mock::session(transport);
        let error = edit(&session, "Alpha", "x", "y").expect_err("must fail");
        assert_eq!(error.code(), Some("editfailed"));
    }
}
