//! Request dispatch onto the engine.
//!
//! Engine-control commands are serialized per engine: one in flight at
//! a time, extras queue in arrival order behind the dispatch lock. The
//! reply is only built after the operation's effects have applied.

use ralph_tui_engine::{Engine, EngineError};

use crate::config_push::{check_config, push_config, ConfigPushError};
use crate::protocol::{error_codes, Message, Payload};
use crate::server::ServerContext;

/// Handle one authenticated request; `None` for payloads that need no
/// reply.
pub(crate) async fn dispatch_request(ctx: &ServerContext, message: Message) -> Option<Message> {
    let id = message.id;
    match message.payload {
        Payload::Ping => Some(Message::reply_to(id, Payload::Pong)),

        Payload::GetState => Some(Message::reply_to(
            id,
            Payload::StateResponse {
                state: ctx.engine.state(),
            },
        )),

        Payload::GetTasks => Some(match ctx.engine.tasks().await {
            Ok(tasks) => Message::reply_to(id, Payload::TasksResponse { tasks }),
            Err(e) => error_reply(id, error_codes::INTERNAL_ERROR, &e.to_string()),
        }),

        Payload::GetPromptPreview => Some(match ctx.engine.prompt_preview().await {
            Ok(preview) => {
                let (task, prompt) = match preview {
                    Some((task, prompt)) => (Some(task), Some(prompt)),
                    None => (None, None),
                };
                Message::reply_to(id, Payload::PromptPreviewResponse { task, prompt })
            }
            Err(e) => error_reply(id, error_codes::INTERNAL_ERROR, &e.to_string()),
        }),

        Payload::GetIterationOutput { iteration } => {
            let output = ctx.engine.iteration_output(iteration);
            Some(Message::reply_to(
                id,
                Payload::IterationOutputResponse {
                    iteration,
                    output: output.as_ref().map(|o| o.output.clone()),
                    stderr: output.map(|o| o.stderr),
                },
            ))
        }

        Payload::CheckConfig => Some(Message::reply_to(
            id,
            check_config(&ctx.config.config_paths),
        )),

        Payload::PushConfig {
            scope,
            config_content,
            overwrite,
        } => {
            let payload = match push_config(&ctx.config.config_paths, scope, &config_content, overwrite)
            {
                Ok(outcome) => Payload::PushConfigResponse {
                    success: true,
                    config_path: Some(outcome.config_path.display().to_string()),
                    backup_path: outcome.backup_path.map(|p| p.display().to_string()),
                    migration_triggered: outcome.migration_triggered,
                    requires_restart: outcome.requires_restart,
                    error: None,
                },
                Err(e) => {
                    let refused = matches!(
                        e,
                        ConfigPushError::InvalidToml(_) | ConfigPushError::AlreadyExists(_)
                    );
                    if !refused {
                        tracing::error!("config push failed: {e}");
                    }
                    Payload::PushConfigResponse {
                        success: false,
                        config_path: None,
                        backup_path: None,
                        migration_triggered: false,
                        requires_restart: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            Some(Message::reply_to(id, payload))
        }

        Payload::Pause
        | Payload::Resume
        | Payload::Interrupt
        | Payload::RefreshTasks
        | Payload::AddIterations { .. }
        | Payload::RemoveIterations { .. }
        | Payload::Continue => {
            let _serialized = ctx.dispatch_lock.lock().await;
            let (operation, result) = apply_engine_op(&ctx.engine, &message.payload).await;
            Some(Message::reply_to(
                id,
                Payload::OperationResult {
                    operation: operation.to_string(),
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                },
            ))
        }

        // Anything else is a known type that makes no sense as a
        // client request here.
        other => {
            tracing::debug!(?other, "unexpected message from client");
            Some(error_reply(
                id,
                error_codes::PROTOCOL_ERROR,
                "unexpected message type",
            ))
        }
    }
}

async fn apply_engine_op(
    engine: &Engine,
    payload: &Payload,
) -> (&'static str, Result<(), EngineError>) {
    match payload {
        Payload::Pause => ("pause", engine.pause().await),
        Payload::Resume => ("resume", engine.resume().await),
        Payload::Interrupt => ("interrupt", engine.interrupt().await),
        Payload::RefreshTasks => ("refresh_tasks", engine.refresh_tasks().await),
        Payload::AddIterations { count } => ("add_iterations", engine.add_iterations(*count).await),
        Payload::RemoveIterations { count } => {
            ("remove_iterations", engine.remove_iterations(*count).await)
        }
        Payload::Continue => ("continue", engine.continue_run()),
        _ => unreachable!("apply_engine_op called with a non-control payload"),
    }
}

pub(crate) fn error_reply(id: uuid::Uuid, code: &str, message: &str) -> Message {
    Message::reply_to(
        id,
        Payload::Error {
            code: code.to_string(),
            message: message.to_string(),
        },
    )
}
