use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use parley_common::{Error, Result};
use parley_db::ToolInit;
use serde::Deserialize;

use super::{ToolDefinition, ToolSchema, TypedTool};

const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// Reports the current time, optionally shifted to a fixed UTC offset.
pub struct CurrentTime;

#[derive(Debug, Deserialize)]
pub struct CurrentTimeInput {
    #[serde(default)]
    utc_offset_minutes: Option<i32>,
}

#[async_trait]
impl TypedTool for CurrentTime {
    type Input = CurrentTimeInput;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "current_time".into(),
            description: "Get the current date and time in RFC 3339 format.".into(),
            requires_init: false,
            schema: ToolSchema::new().property(
                "utc_offset_minutes",
                "integer",
                "Offset from UTC in minutes (e.g. 120 for UTC+2). Defaults to 0.",
            ),
        }
    }

    async fn run(&self, input: CurrentTimeInput, _init: Option<&ToolInit>) -> Result<String> {
        let minutes = input.utc_offset_minutes.unwrap_or(0);
        if minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(Error::Tool(format!(
                "utc_offset_minutes must be within ±{MAX_OFFSET_MINUTES}"
            )));
        }
        let offset = FixedOffset::east_opt(minutes * 60)
            .ok_or_else(|| Error::Tool(format!("invalid offset: {minutes} minutes")))?;
        Ok(Utc::now().with_timezone(&offset).to_rfc3339())
    }
}
