//! Remote script evaluation for the `eval` command.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commands::normalize::normalize;
use crate::media::Page;

/// Inbound `eval` payload. Both fields must be present and non-empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EvalRequest {
    pub id: Option<String>,
    pub code: Option<String>,
}

/// Outbound `eval` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalResponse {
    pub id: String,
    pub result: String,
}

/// Wraps statement-style snippets so they can `return` and `await`.
///
/// # Example
/// ```
/// use streamvisor::prepare_script;
///
/// assert_eq!(prepare_script("1 + 1"), "1 + 1");
/// assert_eq!(prepare_script("return 1 + 1"), "(async () => { return 1 + 1 } )()");
/// ```
pub fn prepare_script(code: &str) -> String {
    if code.contains("return") || code.contains("await") {
        format!("(async () => {{ {code} }} )()")
    } else {
        code.to_string()
    }
}

/// Evaluates `code` in `page` and returns the normalized result.
///
/// Never fails: an evaluation fault yields its message, an elapsed `timeout` yields a
/// timeout message.
pub async fn evaluate(page: &dyn Page, code: &str, timeout: Option<Duration>) -> String {
    let script = prepare_script(code);
    let run = async {
        match page.evaluate(&script).await {
            Ok(value) => normalize(value).await,
            Err(e) => e.to_string(),
        }
    };
    match timeout {
        None => run.await,
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => format!("evaluation did not finish within {limit:?}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::RemoteValue;
    use crate::error::SourceError;
    use async_trait::async_trait;
    use serde_json::json;

    struct Scripted;

    #[async_trait]
    impl Page for Scripted {
        async fn reload(&self) -> Result<bool, SourceError> {
            Ok(true)
        }
        async fn evaluate(&self, script: &str) -> Result<RemoteValue, SourceError> {
            match script {
                "(async () => { return 1+1 } )()" => Ok(RemoteValue::pending(async {
                    RemoteValue::Data(json!(2))
                })),
                "boom()" => Err(SourceError::Evaluate("ReferenceError: boom is not defined".into())),
                "hang()" => std::future::pending().await,
                other => Ok(RemoteValue::Data(json!(other))),
            }
        }
        async fn ack_frame(&self, _session_id: u64) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[test]
    fn await_also_triggers_wrapping() {
        assert_eq!(
            prepare_script("await page.ready"),
            "(async () => { await page.ready } )()"
        );
    }

    #[tokio::test]
    async fn statement_snippets_are_wrapped_and_settled() {
        assert_eq!(evaluate(&Scripted, "return 1+1", None).await, "2");
    }

    #[tokio::test]
    async fn faults_become_the_result() {
        assert_eq!(
            evaluate(&Scripted, "boom()", None).await,
            "ReferenceError: boom is not defined"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_a_hung_script() {
        let result = evaluate(&Scripted, "hang()", Some(Duration::from_secs(1))).await;
        assert!(result.contains("did not finish"), "{result}");
    }

    #[test]
    fn request_fields_are_optional() {
        let req: EvalRequest = serde_json::from_value(json!({"id": "42"})).unwrap();
        assert_eq!(req.id.as_deref(), Some("42"));
        assert!(req.code.is_none());
    }
}
