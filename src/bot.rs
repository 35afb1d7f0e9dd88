//! Bot core
//!
//! Glues the engines, the conversation memory and the request queues
//! together. A front end submits [`ChatRequest`]s and [`ImageRequest`]s and
//! reads the answers from the channel carried by each request; a full queue
//! is answered right away with a [`Submission::Rejected`] text.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, Settings};
use crate::imagegen::ImageSession;
use crate::llm::{Message, SamplingParams, Session};
use crate::memory::{lock, Memory};
use crate::scheduler::{Dispatcher, RequestHandler};

const CHAT_REJECTED: &str = "Sorry! I have too many pending chat requests. Please retry in a moment.";
const IMAGE_REJECTED: &str =
    "Sorry! I have too many pending image requests. Please retry in a moment.";

/// Streamed fragments buffered between the engine and the front end
const FRAGMENT_BUFFER: usize = 32;

/// One user message waiting for a reply
#[derive(Debug)]
pub struct ChatRequest {
    pub user: String,
    pub channel: String,
    pub message: String,
    /// Receives the fragments, then exactly one `Done` or `Failed`
    pub reply: mpsc::Sender<ChatEvent>,
}

/// Progress of a chat reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Fragment(String),
    /// Full normalized reply, already appended to the conversation
    Done(String),
    /// Text to show the user instead of a reply
    Failed(String),
}

/// One image prompt waiting for a picture
#[derive(Debug)]
pub struct ImageRequest {
    pub user: String,
    pub channel: String,
    pub prompt: String,
    pub seed: i64,
    pub reply: oneshot::Sender<ImageReply>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReply {
    /// PNG bytes
    Image(Vec<u8>),
    Failed(String),
}

/// Result of handing a request to the bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The queue is full; the text is meant for the user
    Rejected(String),
}

struct ChatWorker {
    llm: Option<Arc<Session>>,
    memory: Arc<Memory>,
    prompt_system: String,
    params: SamplingParams,
}

impl ChatWorker {
    /// Appends the user message, seeding an empty conversation first, and
    /// returns the messages to send.
    fn prepare(&self, request: &ChatRequest) -> Vec<Message> {
        let conv = self.memory.get(&request.user, &request.channel);
        let mut conv = lock(&conv);
        if conv.messages.is_empty() && !self.prompt_system.is_empty() {
            conv.messages.push(Message::system(self.prompt_system.clone()));
        }
        conv.messages.push(Message::user(request.message.clone()));
        conv.messages.clone()
    }

    async fn reply(&self, llm: &Session, request: &ChatRequest) -> ChatEvent {
        let msgs = self.prepare(request);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);

        // Owns `rx` so the receiver is dropped as soon as forwarding stops.
        let forward = {
            let cancel = cancel.clone();
            async move {
                while let Some(fragment) = rx.recv().await {
                    if request.reply.send(ChatEvent::Fragment(fragment)).await.is_err() {
                        tracing::debug!(user = %request.user, "front end went away, cancelling");
                        cancel.cancel();
                        break;
                    }
                }
            }
        };
        let (outcome, ()) = tokio::join!(
            llm.prompt_streaming(&msgs, &self.params, tx, cancel.clone()),
            forward
        );

        match outcome.into_result() {
            Ok(text) => {
                let conv = self.memory.get(&request.user, &request.channel);
                lock(&conv).messages.push(Message::assistant(text.clone()));
                ChatEvent::Done(text)
            }
            Err(e) => {
                tracing::error!(user = %request.user, channel = %request.channel, error = %e, "chat failed");
                ChatEvent::Failed(format!(
                    "Prompt generation failed: {}\nTry /forget to reset the internal state",
                    e
                ))
            }
        }
    }
}

#[async_trait]
impl RequestHandler<ChatRequest> for ChatWorker {
    async fn handle(&self, request: ChatRequest) {
        let event = match &self.llm {
            Some(llm) => self.reply(llm, &request).await,
            None => ChatEvent::Failed("No LLM is configured".to_string()),
        };
        if request.reply.send(event).await.is_err() {
            tracing::debug!(user = %request.user, "reply dropped");
        }
    }
}

struct ImageWorker {
    image: Option<Arc<ImageSession>>,
}

#[async_trait]
impl RequestHandler<ImageRequest> for ImageWorker {
    async fn handle(&self, request: ImageRequest) {
        let reply = match &self.image {
            Some(image) => match image.generate(&request.prompt, request.seed).await {
                Ok(png) => ImageReply::Image(png),
                Err(e) => ImageReply::Failed(format!("Image generation failed: {}", e)),
            },
            None => ImageReply::Failed("No image engine is configured".to_string()),
        };
        if request.reply.send(reply).is_err() {
            tracing::debug!(user = %request.user, "image reply dropped");
        }
    }
}

/// The chat bot behind any front end
pub struct Bot {
    llm: Option<Arc<Session>>,
    image: Option<Arc<ImageSession>>,
    memory: Arc<Memory>,
    settings: Settings,
    params: SamplingParams,
    dispatcher: Option<Dispatcher<ChatRequest, ImageRequest>>,
}

impl Bot {
    pub fn new(
        llm: Option<Arc<Session>>,
        image: Option<Arc<ImageSession>>,
        memory: Arc<Memory>,
        settings: Settings,
    ) -> Self {
        Self {
            llm,
            image,
            memory,
            settings,
            params: SamplingParams::default(),
            dispatcher: None,
        }
    }

    /// Sampling parameters used for every chat reply
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Start one worker per queue. Calling it again is a no-op.
    pub fn spawn_workers(&mut self, scheduler: &SchedulerConfig) {
        if self.dispatcher.is_some() {
            return;
        }
        let chat = ChatWorker {
            llm: self.llm.clone(),
            memory: Arc::clone(&self.memory),
            prompt_system: self.settings.prompt_system.clone(),
            params: self.params,
        };
        let image = ImageWorker {
            image: self.image.clone(),
        };
        self.dispatcher = Some(Dispatcher::spawn(
            scheduler.chat_capacity,
            scheduler.image_capacity,
            chat,
            image,
        ));
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Queue a chat request without waiting.
    pub fn submit_chat(&self, request: ChatRequest) -> Submission {
        let Some(dispatcher) = &self.dispatcher else {
            return Submission::Rejected(CHAT_REJECTED.to_string());
        };
        match dispatcher.submit_chat(request) {
            Ok(()) => Submission::Queued,
            Err(full) => {
                let queue = full.queue().to_string();
                let request = full.into_inner();
                tracing::info!(queue = %queue, user = %request.user, "chat rejected");
                Submission::Rejected(CHAT_REJECTED.to_string())
            }
        }
    }

    /// Queue an image request without waiting.
    pub fn submit_image(&self, request: ImageRequest) -> Submission {
        let Some(dispatcher) = &self.dispatcher else {
            return Submission::Rejected(IMAGE_REJECTED.to_string());
        };
        match dispatcher.submit_image(request) {
            Ok(()) => Submission::Queued,
            Err(full) => {
                let queue = full.queue().to_string();
                let request = full.into_inner();
                tracing::info!(queue = %queue, user = %request.user, "image rejected");
                Submission::Rejected(IMAGE_REJECTED.to_string())
            }
        }
    }

    /// Reset the conversation of `user` in `channel`.
    ///
    /// With `system_prompt`, the fresh conversation starts with it instead
    /// of the configured one. Returns the text to show the user.
    pub fn forget(&self, user: &str, channel: &str, system_prompt: Option<&str>) -> String {
        let known = self.memory.reset(user, channel);
        let mut reply = if known {
            "The memory of our past conversations just got zapped.".to_string()
        } else {
            "I don't know you. I can't wait to start our discussion so I can get to know you better!"
                .to_string()
        };
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            let conv = self.memory.get(user, channel);
            lock(&conv).messages.push(Message::system(prompt));
            reply.push_str("\n*System prompt*: ");
            reply.push_str(prompt);
        }
        tracing::info!(user, channel, known, "conversation forgotten");
        reply
    }

    /// Drain both queues and stop the workers.
    pub async fn shutdown(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> Bot {
        let mut bot = Bot::new(None, None, Arc::new(Memory::new()), Settings::default());
        bot.spawn_workers(&SchedulerConfig::default());
        bot
    }

    #[tokio::test]
    async fn test_forget_unknown_then_known() {
        let bot = bot();
        assert!(bot.forget("alice", "general", None).starts_with("I don't know you."));

        bot.memory().get("alice", "general");
        assert_eq!(
            bot.forget("alice", "general", None),
            "The memory of our past conversations just got zapped."
        );
    }

    #[tokio::test]
    async fn test_forget_with_system_prompt() {
        let bot = bot();
        bot.memory().get("bob", "dm");
        let reply = bot.forget("bob", "dm", Some("You are a pirate."));
        assert!(reply.ends_with("\n*System prompt*: You are a pirate."));

        let conv = bot.memory().get("bob", "dm");
        let conv = lock(&conv);
        assert_eq!(conv.messages, vec![Message::system("You are a pirate.")]);
    }

    #[tokio::test]
    async fn test_chat_without_llm_fails() {
        let bot = bot();
        let (tx, mut rx) = mpsc::channel(4);
        let submission = bot.submit_chat(ChatRequest {
            user: "alice".to_string(),
            channel: "general".to_string(),
            message: "hi".to_string(),
            reply: tx,
        });
        assert_eq!(submission, Submission::Queued);
        assert_eq!(
            rx.recv().await,
            Some(ChatEvent::Failed("No LLM is configured".to_string()))
        );
        bot.shutdown().await;
    }

    #[tokio::test]
    async fn test_image_without_engine_fails() {
        let bot = bot();
        let (tx, rx) = oneshot::channel();
        bot.submit_image(ImageRequest {
            user: "alice".to_string(),
            channel: "general".to_string(),
            prompt: "a cat".to_string(),
            seed: 1,
            reply: tx,
        });
        assert!(matches!(rx.await.unwrap(), ImageReply::Failed(_)));
        bot.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_before_workers_is_rejected() {
        let bot = Bot::new(None, None, Arc::new(Memory::new()), Settings::default());
        let (tx, _rx) = mpsc::channel(1);
        let submission = bot.submit_chat(ChatRequest {
            user: "u".to_string(),
            channel: "c".to_string(),
            message: "m".to_string(),
            reply: tx,
        });
        assert_eq!(submission, Submission::Rejected(CHAT_REJECTED.to_string()));
    }
}
