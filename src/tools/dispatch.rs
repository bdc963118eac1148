//! Tool dispatch: JSON tool calls in, JSON tool responses out.
//!
//! Destructive statements are not errors here. Without `"confirm": true` they
//! come back as `confirmation_required`, and the caller can re-send the call.

use crate::config::ConnectionResolver;
use crate::db::Dialect;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;
use crate::models::ExplainFormat;
use crate::tools::guard::validate_query_for;
use crate::tools::redact::redact_value;
use crate::tools::schema_diff::generate_migration_script;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIRM_HINT: &str = "Re-send the call with \"confirm\": true to run it anyway";

/// One tool invocation as received from the transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    Ok {
        data: JsonValue,
    },
    ConfirmationRequired {
        reason: String,
        hint: String,
    },
    Error {
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
}

impl ToolResponse {
    fn confirmation(reason: String) -> Self {
        Self::ConfirmationRequired {
            reason,
            hint: CONFIRM_HINT.to_string(),
        }
    }
}

impl From<GatewayError> for ToolResponse {
    fn from(err: GatewayError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            suggestion: err.suggestion().map(String::from),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionInput {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct RunQueryInput {
    connection_id: String,
    sql: String,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    pooled: bool,
}

#[derive(Debug, Deserialize)]
struct TransactionInput {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct TransactionQueryInput {
    transaction_id: String,
    sql: String,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct PoolStatsInput {
    #[serde(default)]
    connection_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClosePoolInput {
    connection_id: String,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct ExplainInput {
    connection_id: String,
    sql: String,
    #[serde(default)]
    analyze: bool,
    #[serde(default)]
    format: ExplainFormat,
}

#[derive(Debug, Deserialize)]
struct CompareSchemasInput {
    source_connection_id: String,
    target_connection_id: String,
    #[serde(default)]
    schema: Option<String>,
    /// Dialect of the migration script; the target's dialect when omitted
    #[serde(default)]
    dialect: Option<String>,
}

fn decode<T: DeserializeOwned>(tool: &str, arguments: &JsonValue) -> GatewayResult<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments)
        .map_err(|e| GatewayError::validation(format!("invalid arguments for '{tool}': {e}")))
}

fn to_data<T: Serialize>(value: T) -> GatewayResult<ToolResponse> {
    let data = serde_json::to_value(value)
        .map_err(|e| GatewayError::resource(format!("failed to serialize response: {e}")))?;
    Ok(ToolResponse::Ok { data })
}

pub struct ToolDispatcher {
    gateway: Arc<Gateway>,
    connections: Arc<dyn ConnectionResolver>,
}

impl ToolDispatcher {
    pub fn new(gateway: Arc<Gateway>, connections: Arc<dyn ConnectionResolver>) -> Self {
        Self {
            gateway,
            connections,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Handle one call. Never fails: errors become `ToolResponse::Error`.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResponse {
        debug!(
            tool = %call.tool_name,
            arguments = %redact_value(&call.arguments),
            "Dispatching tool call"
        );
        match self.route(&call).await {
            Ok(response) => response,
            Err(err) => {
                info!(tool = %call.tool_name, kind = err.kind(), error = %err, "Tool call failed");
                err.into()
            }
        }
    }

    async fn route(&self, call: &ToolCall) -> GatewayResult<ToolResponse> {
        let tool = call.tool_name.as_str();
        let args = &call.arguments;
        match tool {
            "list_connections" => {
                let list: Vec<JsonValue> =
                    self.connections.list().iter().map(|d| d.redacted()).collect();
                to_data(list)
            }
            "get_connection" => {
                let input: ConnectionInput = decode(tool, args)?;
                to_data(self.connections.resolve(&input.connection_id)?.redacted())
            }
            "run_query" => self.run_query(decode(tool, args)?).await,
            "begin_transaction" => {
                let input: ConnectionInput = decode(tool, args)?;
                let descriptor = self.connections.resolve(&input.connection_id)?;
                to_data(self.gateway.begin_transaction(&descriptor).await?)
            }
            "execute_in_transaction" => {
                let input: TransactionQueryInput = decode(tool, args)?;
                if !input.confirm {
                    let dialect = self.gateway.transaction_dialect(&input.transaction_id).await?;
                    if let Some(reason) = validate_query_for(&dialect, &input.sql) {
                        return Ok(ToolResponse::confirmation(reason));
                    }
                }
                let result = if input.confirm {
                    self.gateway
                        .execute_in_transaction_confirmed(&input.transaction_id, &input.sql)
                        .await?
                } else {
                    self.gateway
                        .execute_in_transaction(&input.transaction_id, &input.sql)
                        .await?
                };
                to_data(result)
            }
            "commit_transaction" => {
                let input: TransactionInput = decode(tool, args)?;
                to_data(self.gateway.commit_transaction(&input.transaction_id).await?)
            }
            "rollback_transaction" => {
                let input: TransactionInput = decode(tool, args)?;
                to_data(self.gateway.rollback_transaction(&input.transaction_id).await?)
            }
            "list_transactions" => to_data(self.gateway.list_transactions().await),
            "pool_stats" => {
                let input: PoolStatsInput = decode(tool, args)?;
                match input.connection_id {
                    Some(id) => to_data(self.gateway.get_stats(&id).await),
                    None => {
                        let mut stats = Vec::new();
                        for info in self.gateway.list_pools().await {
                            let current = self.gateway.get_stats(&info.connection_id).await;
                            stats.push(json!({ "pool": info, "stats": current }));
                        }
                        to_data(stats)
                    }
                }
            }
            "close_pool" => {
                let input: ClosePoolInput = decode(tool, args)?;
                if !input.confirm {
                    return Ok(ToolResponse::confirmation(format!(
                        "Closing the pool for '{}' drops all of its idle connections",
                        input.connection_id
                    )));
                }
                let closed = self.gateway.close_pool(&input.connection_id).await;
                to_data(json!({ "connection_id": input.connection_id, "closed": closed }))
            }
            "explain_query" => {
                let input: ExplainInput = decode(tool, args)?;
                let descriptor = self.connections.resolve(&input.connection_id)?;
                let plan = self
                    .gateway
                    .explain(&descriptor, &input.sql, input.analyze, input.format)
                    .await?;
                to_data(plan)
            }
            "compare_schemas" => {
                let input: CompareSchemasInput = decode(tool, args)?;
                let source = self.connections.resolve(&input.source_connection_id)?;
                let target = self.connections.resolve(&input.target_connection_id)?;
                let diff = self
                    .gateway
                    .diff_schemas(&source, &target, input.schema.as_deref())
                    .await?;
                let dialect = Dialect::classify(input.dialect.as_deref().unwrap_or(&target.driver));
                let migration = generate_migration_script(&diff, &dialect);
                to_data(json!({ "diff": diff, "migration": migration }))
            }
            other => Err(GatewayError::validation(format!("unknown tool '{other}'"))),
        }
    }

    async fn run_query(&self, input: RunQueryInput) -> GatewayResult<ToolResponse> {
        let descriptor = self.connections.resolve(&input.connection_id)?;
        if !input.confirm {
            let dialect = Dialect::classify(&descriptor.driver);
            if let Some(reason) = validate_query_for(&dialect, &input.sql) {
                return Ok(ToolResponse::confirmation(reason));
            }
        }
        let result = match (input.confirm, input.pooled) {
            (true, pooled) => {
                self.gateway
                    .execute_confirmed(&descriptor, &input.sql, pooled)
                    .await?
            }
            (false, true) => self.gateway.execute_pooled(&descriptor, &input.sql).await?,
            (false, false) => self.gateway.execute(&descriptor, &input.sql).await?,
        };
        to_data(result)
    }
}
