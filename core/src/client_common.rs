use crate::error::Result;
use crate::models::ResponseItem;
use futures::Stream;
use serde::Serialize;
use std::borrow::Cow;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use tokio::sync::mpsc;

/// The `instructions` field in the payload sent to the model always starts
/// with this content.
pub(crate) const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");

/// API request payload for a single model turn.
#[derive(Default, Debug, Clone)]
pub struct Prompt {
    /// Full conversation transcript, resent on every turn.
    pub input: Vec<ResponseItem>,
    /// Optional extra instructions appended to the built-in system prompt.
    pub user_instructions: Option<String>,
}

impl Prompt {
    pub(crate) fn get_full_instructions(&self) -> Cow<'_, str> {
        match &self.user_instructions {
            Some(user) => Cow::Owned(format!("{BASE_INSTRUCTIONS}\n{user}")),
            None => Cow::Borrowed(BASE_INSTRUCTIONS),
        }
    }
}

#[derive(Debug)]
pub enum ResponseEvent {
    OutputItemDone(ResponseItem),
    Completed { response_id: String },
}

/// Request object that is serialized as JSON and POST'ed to the model
/// endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct ResponsesApiRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) instructions: &'a str,
    pub(crate) input: &'a Vec<ResponseItem>,
    pub(crate) tools: &'a [serde_json::Value],
    pub(crate) tool_choice: &'static str,
    /// Always false: tool calls must execute strictly in order against one
    /// sandbox, so the model is never allowed two outstanding calls.
    pub(crate) parallel_tool_calls: bool,
    pub(crate) stream: bool,
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}
