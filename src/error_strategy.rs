//! Retry-with-delay vs stop-group policy (C11, §4.11).

use std::sync::Arc;

use serde_json::json;

use crate::errors::CoreError;
use crate::message::Message;

/// What a consumer group should do after a handler failure.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum GroupAction {
    Retry {
        at: chrono::DateTime<chrono::Utc>,
        error_context: serde_json::Value,
    },
    Stop {
        reason: String,
    },
}

/// Stateless decision function `(error, message, current error_context)
/// -> GroupAction` (§4.11). The default implementation reads
/// `retry_count` out of `error_context` (defaulting to 1) and compares
/// it against `max_retries`.
pub trait ErrorStrategy: Send + Sync {
    fn decide(
        &self,
        error: &CoreError,
        message: &Message,
        current_error_context: &serde_json::Value,
    ) -> GroupAction;
}

/// Exponential-by-default backoff: `retry_after * retry_count`.
pub type BackoffFn = Arc<dyn Fn(std::time::Duration, u32) -> std::time::Duration + Send + Sync>;

pub struct DefaultErrorStrategy {
    pub max_retries: u32,
    pub retry_after: std::time::Duration,
    pub backoff: BackoffFn,
    pub on_retry: Option<Arc<dyn Fn(&CoreError, &Message, u32) + Send + Sync>>,
    pub on_stop: Option<Arc<dyn Fn(&CoreError, &Message) + Send + Sync>>,
}

impl Default for DefaultErrorStrategy {
    fn default() -> Self {
        Self {
            max_retries: 25,
            retry_after: std::time::Duration::from_secs(1),
            backoff: Arc::new(|retry_after, n| retry_after * n),
            on_retry: None,
            on_stop: None,
        }
    }
}

impl ErrorStrategy for DefaultErrorStrategy {
    fn decide(
        &self,
        error: &CoreError,
        message: &Message,
        current_error_context: &serde_json::Value,
    ) -> GroupAction {
        let retry_count = current_error_context
            .get("retry_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        if retry_count <= self.max_retries {
            let delay = (self.backoff)(self.retry_after, retry_count);
            let at = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            if let Some(cb) = &self.on_retry {
                cb(error, message, retry_count);
            }
            GroupAction::Retry {
                at,
                error_context: json!({
                    "retry_count": retry_count + 1,
                    "reason": error.reason_label(),
                }),
            }
        } else {
            if let Some(cb) = &self.on_stop {
                cb(error, message);
            }
            GroupAction::Stop {
                reason: error.reason_label().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("c1", "cart.AddItem", serde_json::json!({}))
    }

    #[test]
    fn retries_while_under_the_cap() {
        let strategy = DefaultErrorStrategy {
            max_retries: 2,
            ..Default::default()
        };
        let err = CoreError::Handler("boom".into());
        let action = strategy.decide(&err, &msg(), &json!({}));
        match action {
            GroupAction::Retry { error_context, .. } => {
                assert_eq!(error_context["retry_count"], json!(2));
            }
            GroupAction::Stop { .. } => panic!("expected retry"),
        }
    }

    #[test]
    fn stops_once_retry_count_exceeds_max() {
        let strategy = DefaultErrorStrategy {
            max_retries: 2,
            ..Default::default()
        };
        let err = CoreError::Handler("boom".into());
        let action = strategy.decide(&err, &msg(), &json!({"retry_count": 3}));
        match action {
            GroupAction::Stop { reason } => assert_eq!(reason, "HandlerError"),
            GroupAction::Retry { .. } => panic!("expected stop"),
        }
    }

    #[test]
    fn backoff_scales_with_retry_count() {
        let strategy = DefaultErrorStrategy {
            max_retries: 5,
            retry_after: std::time::Duration::from_secs(1),
            ..Default::default()
        };
        let err = CoreError::Handler("boom".into());
        let first = strategy.decide(&err, &msg(), &json!({"retry_count": 1}));
        let second = strategy.decide(&err, &msg(), &json!({"retry_count": 2}));
        let extract_at = |a: GroupAction| match a {
            GroupAction::Retry { at, .. } => at,
            _ => panic!("expected retry"),
        };
        let at1 = extract_at(first);
        let at2 = extract_at(second);
        assert!(at2 > at1);
    }
}
