//! Chat-template formatting
//!
//! Messages cross the boundary as a JSON array of `{"role", "content"}`
//! objects; the engine renders them with the model's built-in template, a named
//! template, or a Jinja template.

use crate::demarshal::{NativeChatResult, NativeString};
use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::marshal;
use crate::result::ChatResult;
use crate::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Input for Jinja chat formatting with optional tool calling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JinjaChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_template: Option<String>,
    /// JSON schema the response must follow
    #[serde(default)]
    pub json_schema: Option<serde_json::Value>,
    /// Tool definitions, in OpenAI function-calling format
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default)]
    pub tool_choice: Option<String>,
}

impl JinjaChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CactusError::marshal(format!("failed to encode {}: {}", what, e)))
}

impl<E: Engine> Context<E> {
    /// Check whether the model's template (or the named one) can be used
    pub fn validate_chat_template(&self, use_jinja: bool, name: Option<&str>) -> Result<bool> {
        let handle = self.require(Capability::Chat, "validate_chat_template")?;
        let c_name = marshal::c_string_opt(name, "template name")?;
        Ok(unsafe {
            self.engine
                .validate_chat_template(handle, use_jinja, marshal::opt_ptr(&c_name))
        })
    }

    /// Render messages into a prompt
    pub fn formatted_chat(&self, messages: &[ChatMessage], chat_template: Option<&str>) -> Result<String> {
        let handle = self.require(Capability::Chat, "formatted_chat")?;
        let c_messages = marshal::c_string(&to_json(messages, "messages")?, "messages")?;
        let c_template = marshal::c_string_opt(chat_template, "chat template")?;

        let prompt = unsafe {
            NativeString::new(
                &*self.engine,
                self.engine
                    .get_formatted_chat(handle, c_messages.as_ptr(), marshal::opt_ptr(&c_template)),
            )
        };
        Ok(prompt.to_string_lossy())
    }

    /// Render messages through a Jinja template, with grammar/tool metadata
    pub fn formatted_chat_with_jinja(&self, request: &JinjaChatRequest) -> Result<ChatResult> {
        let handle = self.require(Capability::Chat, "formatted_chat_with_jinja")?;
        let c_messages = marshal::c_string(&to_json(&request.messages, "messages")?, "messages")?;
        let c_template = marshal::c_string_opt(request.chat_template.as_deref(), "chat template")?;
        let json_schema = request
            .json_schema
            .as_ref()
            .map(|s| to_json(s, "json schema"))
            .transpose()?;
        let tools = request.tools.as_ref().map(|t| to_json(t, "tools")).transpose()?;
        let c_schema = marshal::c_string_opt(json_schema.as_deref(), "json schema")?;
        let c_tools = marshal::c_string_opt(tools.as_deref(), "tools")?;
        let c_tool_choice = marshal::c_string_opt(request.tool_choice.as_deref(), "tool choice")?;

        let result = unsafe {
            NativeChatResult::new(
                &*self.engine,
                self.engine.get_formatted_chat_with_jinja(
                    handle,
                    c_messages.as_ptr(),
                    marshal::opt_ptr(&c_template),
                    marshal::opt_ptr(&c_schema),
                    marshal::opt_ptr(&c_tools),
                    request.parallel_tool_calls,
                    marshal::opt_ptr(&c_tool_choice),
                ),
            )
        };
        Ok(result.to_result())
    }
}
