#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sip2_domain::Command;
use sip2_protocol::Message;
use tracing::debug;

use crate::server::context::SessionContext;
use crate::server::error::GatewayError;

/// Business logic for one SIP2 command.
///
/// The returned JSON is the model for the command's response template.
#[async_trait]
pub trait CommandHandler: Send + Sync {
	async fn handle(&self, message: &Message, ctx: &mut SessionContext) -> Result<serde_json::Value, GatewayError>;
}

pub type HandlerMap = HashMap<Command, Arc<dyn CommandHandler>>;

/// Outcome of dispatching one request.
#[derive(Debug, Clone)]
pub enum HandlerResult {
	Success {
		command: Command,
		model: serde_json::Value,
	},
	Failure {
		command: Option<Command>,
		error: GatewayError,
	},
}

impl HandlerResult {
	pub fn is_success(&self) -> bool {
		matches!(self, HandlerResult::Success { .. })
	}

	pub fn failure(command: Option<Command>, error: GatewayError) -> Self {
		HandlerResult::Failure { command, error }
	}
}

/// Routes parsed messages to handlers. The map is supplied whole at construction.
#[derive(Clone, Default)]
pub struct Dispatcher {
	handlers: HandlerMap,
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut commands: Vec<_> = self.handlers.keys().copied().collect();
		commands.sort();
		f.debug_struct("Dispatcher").field("commands", &commands).finish()
	}
}

impl Dispatcher {
	pub fn new(handlers: HandlerMap) -> Self {
		Self { handlers }
	}

	pub fn handles(&self, command: Command) -> bool {
		self.handlers.contains_key(&command)
	}

	pub async fn dispatch(&self, message: &Message, ctx: &mut SessionContext) -> HandlerResult {
		let Some(command) = message.command else {
			return HandlerResult::failure(None, GatewayError::unrecognized(&message.code));
		};

		let Some(handler) = self.handlers.get(&command) else {
			debug!(session_id = %ctx.session_id(), %command, "no handler registered");
			return HandlerResult::failure(Some(command), GatewayError::unrecognized(&message.code));
		};

		match handler.handle(message, ctx).await {
			Ok(model) => HandlerResult::Success { command, model },
			Err(error) => HandlerResult::failure(Some(command), error),
		}
	}
}
