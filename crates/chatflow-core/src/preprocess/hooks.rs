//! Caller-supplied transforms run on the windowed copy of history.

use chatflow_types::error::PipelineError;
use chatflow_types::message::Message;

use super::CompletionRequestPack;

/// A transform over the outbound message list.
///
/// Hooks run in registration order, right after windowing. An error aborts
/// the send.
pub trait MessageHook: Send + Sync {
    fn name(&self) -> &str;

    fn apply(
        &self,
        messages: &mut Vec<Message>,
        pack: &CompletionRequestPack,
    ) -> Result<(), PipelineError>;
}

/// Hook backed by a closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&mut Vec<Message>, &CompletionRequestPack) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> MessageHook for FnHook<F>
where
    F: Fn(&mut Vec<Message>, &CompletionRequestPack) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        messages: &mut Vec<Message>,
        pack: &CompletionRequestPack,
    ) -> Result<(), PipelineError> {
        (self.f)(messages, pack).map_err(|message| PipelineError::Hook {
            hook: self.name.clone(),
            message,
        })
    }
}
