//! # Command routing.
//!
//! [`CommandDispatcher`] maps a topic to exactly one [`CommandHandler`]. The broker
//! connection calls [`CommandDispatcher::dispatch`] once per inbound message and awaits it,
//! so handlers on one connection never overlap.
//!
//! | action         | needs                         | does                 | replies          |
//! |----------------|-------------------------------|----------------------|------------------|
//! | `ping`         |                               |                      | `{"pong": true}` |
//! | `pong`         |                               | log                  |                  |
//! | `connected`    |                               | log                  |                  |
//! | `restart`      | reply address                 | supervisor restart   | `true`/`false`   |
//! | `reload`       | reply address, page           | page reload          | `true`/`false`   |
//! | `eval`         | reply address, page, id, code | evaluate + normalize | `{id, result}`   |
//! | `proxy-socket` |                               | nothing              |                  |
//!
//! Topics are `<inbound namespace>.<action>`. Unknown topics are logged and dropped.
//! Handler errors are logged (missing reply address at error level, the rest as warnings);
//! they never reach the supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::broker::{ControlMessage, Publisher};
use crate::commands::eval::{evaluate, EvalRequest, EvalResponse};
use crate::error::CommandError;
use crate::media::Page;

/// What command handlers may ask of the supervisor.
#[async_trait]
pub trait ControlTarget: Send + Sync + 'static {
    /// Runs a restart sequence; `false` if rejected or failed.
    async fn restart(&self) -> bool;

    /// The page of the live render session, if any.
    fn page(&self) -> Option<Arc<dyn Page>>;
}

/// Everything a handler gets for one message.
pub struct CommandContext<'a> {
    pub publisher: &'a dyn Publisher,
    pub target: &'a dyn ControlTarget,
    pub eval_timeout: Option<Duration>,
}

/// Handles one action.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Action name (last topic token).
    fn name(&self) -> &'static str;

    /// Further action names routed to this handler.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    async fn handle(&self, cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError>;
}

/// Topic → handler table.
pub struct CommandDispatcher {
    namespace: String,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    target: Arc<dyn ControlTarget>,
    eval_timeout: Option<Duration>,
}

impl CommandDispatcher {
    /// Creates a dispatcher with the built-in handlers registered under `namespace`.
    pub fn new(
        namespace: impl Into<String>,
        target: Arc<dyn ControlTarget>,
        eval_timeout: Option<Duration>,
    ) -> Self {
        let mut dispatcher = Self {
            namespace: namespace.into(),
            handlers: HashMap::new(),
            target,
            eval_timeout,
        };
        dispatcher.register(Arc::new(Ping));
        dispatcher.register(Arc::new(LogOnly("pong")));
        dispatcher.register(Arc::new(LogOnly("connected")));
        dispatcher.register(Arc::new(Restart));
        dispatcher.register(Arc::new(Reload));
        dispatcher.register(Arc::new(Eval));
        dispatcher.register(Arc::new(ProxySocket));
        dispatcher
    }

    /// Adds (or replaces) a handler for its name and aliases.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let names = std::iter::once(handler.name()).chain(handler.aliases().iter().copied());
        for name in names {
            let topic = format!("{}.{}", self.namespace, name);
            self.handlers.insert(topic, Arc::clone(&handler));
        }
    }

    /// Whether `topic` has a handler.
    pub fn handles(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Routes one message and logs handler errors.
    pub async fn dispatch(&self, msg: &ControlMessage, publisher: &dyn Publisher) {
        let Some(handler) = self.handlers.get(&msg.topic) else {
            warn!(topic = %msg.topic, "unknown message topic");
            return;
        };

        let cx = CommandContext {
            publisher,
            target: self.target.as_ref(),
            eval_timeout: self.eval_timeout,
        };
        if let Err(e) = handler.handle(&cx, msg).await {
            if e.is_precondition() {
                error!(topic = %msg.topic, label = e.as_label(), "{e}");
            } else {
                warn!(topic = %msg.topic, label = e.as_label(), "{e}");
            }
        }
    }
}

fn reply_address(msg: &ControlMessage) -> Result<&str, CommandError> {
    msg.reply
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| CommandError::MissingReplyAddress {
            topic: msg.topic.clone(),
        })
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn handle(&self, cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError> {
        match msg.reply.as_deref() {
            Some(reply) => {
                cx.publisher.publish(reply, Some(json!({ "pong": true }))).await;
            }
            None => debug!(topic = %msg.topic, "ping without reply address"),
        }
        Ok(())
    }
}

struct LogOnly(&'static str);

#[async_trait]
impl CommandHandler for LogOnly {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn handle(&self, _cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError> {
        debug!(topic = %msg.topic, "counterpart {}", self.0);
        Ok(())
    }
}

struct Restart;

#[async_trait]
impl CommandHandler for Restart {
    fn name(&self) -> &'static str {
        "restart"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["streamer-restart"]
    }

    async fn handle(&self, cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError> {
        let reply = reply_address(msg)?;
        debug!("restart requested over the control plane");
        let ok = cx.target.restart().await;
        cx.publisher.publish(reply, Some(json!(ok))).await;
        Ok(())
    }
}

struct Reload;

#[async_trait]
impl CommandHandler for Reload {
    fn name(&self) -> &'static str {
        "reload"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["streamer-reload"]
    }

    async fn handle(&self, cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError> {
        let reply = reply_address(msg)?;
        let page = cx
            .target
            .page()
            .ok_or(CommandError::NoActivePage { action: "reload" })?;

        debug!("reloading page");
        let ok = match page.reload().await {
            Ok(true) => true,
            Ok(false) => {
                warn!("page reload failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "page reload failed");
                false
            }
        };
        cx.publisher.publish(reply, Some(json!(ok))).await;
        Ok(())
    }
}

struct Eval;

#[async_trait]
impl CommandHandler for Eval {
    fn name(&self) -> &'static str {
        "eval"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["streamer-eval"]
    }

    async fn handle(&self, cx: &CommandContext<'_>, msg: &ControlMessage) -> Result<(), CommandError> {
        let reply = reply_address(msg)?;
        let page = cx
            .target
            .page()
            .ok_or(CommandError::NoActivePage { action: "evaluate" })?;

        let invalid = |reason: String| CommandError::InvalidPayload {
            topic: msg.topic.clone(),
            reason,
        };
        let request: Option<EvalRequest> = msg.json().map_err(|e| invalid(e.to_string()))?;
        let request = request.unwrap_or_default();
        let (Some(id), Some(code)) = (
            request.id.filter(|s| !s.is_empty()),
            request.code.filter(|s| !s.is_empty()),
        ) else {
            return Err(invalid("id and code are required".into()));
        };

        debug!(id = %id, "evaluating script");
        let result = evaluate(page.as_ref(), &code, cx.eval_timeout).await;
        debug!(id = %id, result = %result, "script evaluated");

        let response = EvalResponse { id, result };
        let payload = serde_json::to_value(&response).map_err(|e| invalid(e.to_string()))?;
        cx.publisher.publish(reply, Some(payload)).await;
        Ok(())
    }
}

struct ProxySocket;

#[async_trait]
impl CommandHandler for ProxySocket {
    fn name(&self) -> &'static str {
        "proxy-socket"
    }

    async fn handle(&self, _cx: &CommandContext<'_>, _msg: &ControlMessage) -> Result<(), CommandError> {
        Ok(())
    }
}
