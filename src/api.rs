//! # API Module
//!
//! Talks to the completion service.
//!
//! [`CompletionClient`] owns the turn-level policy: message ordering, the
//! credential check, bounded retries with a fixed delay, and appending exactly
//! one Assistant message to the history whatever happens. The wire work sits
//! behind [`ChatBackend`]; [`OpenAiBackend`] implements it for any OpenAI
//! compatible endpoint with `async-openai`, either streaming fragments as they
//! arrive or waiting for the whole reply.
//!
//! # Example
//!
//! ```no_run
//! use grept::api::CompletionClient;
//! use grept::config::GreptConfig;
//! use grept::message::Conversation;
//! use grept::observer::NullObserver;
//!
//! # async fn run() -> Result<(), grept::error::GreptError> {
//! let config = GreptConfig::default();
//! let client = CompletionClient::new(&config)?;
//! let mut history = Conversation::new();
//! history.push_user("What does main.rs do?")?;
//! let completion = client
//!     .complete(&config.system_prompt, &[], &mut history, 256, &mut NullObserver)
//!     .await;
//! println!("{}", completion.text);
//! # Ok(()) }
//! ```

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, warn};

use crate::config::GreptConfig;
use crate::error::{GreptError, Result};
use crate::message::{Conversation, Message};
use crate::observer::{Notice, Observer};

/// Outcome of one turn.
#[derive(Debug)]
pub struct Completion {
    /// The assistant's reply; empty when the turn failed.
    pub text: String,
    pub error: Option<GreptError>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Fully ordered request handed to a [`ChatBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// One attempt at getting a reply from a completion service.
#[async_trait(?Send)]
pub trait ChatBackend {
    /// Send `request` and return the full reply text. Streaming backends
    /// forward each fragment to `observer` as [`Notice::Fragment`].
    async fn send(&self, request: &CompletionRequest, observer: &mut dyn Observer)
    -> Result<String>;

    /// Whether replies were already shown fragment by fragment.
    fn streams(&self) -> bool {
        false
    }
}

/// How often and how patiently to call the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&GreptConfig> for RetryPolicy {
    fn from(config: &GreptConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            attempt_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// Turn-level client for the completion service.
pub struct CompletionClient {
    backend: Box<dyn ChatBackend>,
    has_credential: bool,
    retry: RetryPolicy,
}

impl CompletionClient {
    /// Client for the OpenAI compatible endpoint described by `config`.
    ///
    /// A missing API key is not an error here; every call fails with
    /// [`GreptError::Credential`] instead.
    pub fn new(config: &GreptConfig) -> Result<Self> {
        let backend = OpenAiBackend::new(config)?;
        let has_credential = config.api_key.as_deref().is_some_and(|key| !key.is_empty());
        Ok(Self::with_backend(
            Box::new(backend),
            has_credential,
            config.retry_policy(),
        ))
    }

    pub fn with_backend(
        backend: Box<dyn ChatBackend>,
        has_credential: bool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            has_credential,
            retry,
        }
    }

    /// Ask the service to answer the open turn in `history`.
    ///
    /// Sends `system_prompt`, then `context`, then the whole history, and
    /// appends the reply (or an empty string on failure) as the turn's
    /// Assistant message. Failures are returned in [`Completion::error`] and
    /// reported to `observer`; they never escape as `Err`.
    pub async fn complete(
        &self,
        system_prompt: &str,
        context: &[Message],
        history: &mut Conversation,
        max_tokens: u32,
        observer: &mut dyn Observer,
    ) -> Completion {
        let (text, error) = match self
            .request(system_prompt, context, history, max_tokens, observer)
            .await
        {
            Ok(text) => {
                observer.notice(Notice::Reply {
                    text: &text,
                    streamed: self.backend.streams(),
                });
                (text, None)
            }
            Err(err) => {
                error!("turn failed: {err}");
                observer.notice(Notice::Error(&err.to_string()));
                (String::new(), Some(err))
            }
        };

        if let Err(err) = history.push_assistant(text.clone()) {
            error!("reply not recorded: {err}");
        }

        Completion { text, error }
    }

    async fn request(
        &self,
        system_prompt: &str,
        context: &[Message],
        history: &Conversation,
        max_tokens: u32,
        observer: &mut dyn Observer,
    ) -> Result<String> {
        if !self.has_credential {
            return Err(GreptError::Credential);
        }

        let mut messages = Vec::with_capacity(1 + context.len() + history.len());
        messages.push(Message::System(system_prompt.to_string()));
        messages.extend_from_slice(context);
        messages.extend_from_slice(history.messages());
        debug!(
            "request roles: {}",
            messages
                .iter()
                .map(Message::role)
                .collect::<Vec<_>>()
                .join(",")
        );
        let request = CompletionRequest {
            messages,
            max_tokens,
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            debug!("completion attempt {attempt}/{max_attempts}");
            let mut tally = FragmentTally {
                inner: &mut *observer,
                fragments: 0,
            };
            let sent = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.backend.send(&request, &mut tally),
            )
            .await;
            let fragments = tally.fragments;
            let err = match sent {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {:?}", self.retry.attempt_timeout),
            };

            warn!("completion attempt {attempt}/{max_attempts} failed: {err}");
            if fragments > 0 {
                observer.notice(Notice::PartialDiscarded { fragments });
            }
            if attempt < max_attempts {
                observer.notice(Notice::RetryScheduled {
                    attempt,
                    max_attempts,
                    reason: &err,
                });
                tokio::time::sleep(self.retry.delay).await;
            }
            last_error = err;
        }

        Err(GreptError::Service {
            attempts: max_attempts,
            message: last_error,
        })
    }
}

/// Forwards notices and counts the fragments of the current attempt.
struct FragmentTally<'a> {
    inner: &'a mut dyn Observer,
    fragments: usize,
}

impl Observer for FragmentTally<'_> {
    fn notice(&mut self, notice: Notice<'_>) {
        if let Notice::Fragment(_) = notice {
            self.fragments += 1;
        }
        self.inner.notice(notice);
    }
}

/// [`ChatBackend`] for OpenAI compatible chat completion endpoints.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
    stream: bool,
}

impl OpenAiBackend {
    pub fn new(config: &GreptConfig) -> Result<Self> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone().unwrap_or_default())
            .with_api_base(config.api_base.clone());
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GreptError::Validation(format!("could not build HTTP client: {e}")))?;
        debug!("client created for {} ({})", config.api_base, config.model);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            model: config.model.clone(),
            stream: config.should_stream.unwrap_or(true),
        })
    }

    #[allow(deprecated)]
    fn chat_request(&self, request: &CompletionRequest) -> Result<CreateChatCompletionRequest> {
        let messages = request
            .messages
            .iter()
            .map(to_request_message)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .max_tokens(request.max_tokens)
            .messages(messages)
            .build()?)
    }
}

#[async_trait(?Send)]
impl ChatBackend for OpenAiBackend {
    async fn send(
        &self,
        request: &CompletionRequest,
        observer: &mut dyn Observer,
    ) -> Result<String> {
        let request = self.chat_request(request)?;
        debug!("Sending request: {:?}", request);
        let mut text = String::new();

        if self.stream {
            let mut stream = self.client.chat().create_stream(request).await?;
            while let Some(result) = stream.next().await {
                let response = result?;
                for choice in response.choices {
                    if let Some(content) = choice.delta.content {
                        observer.notice(Notice::Fragment(&content));
                        text.push_str(&content);
                    }
                }
            }
        } else {
            let response = self.client.chat().create(request).await?;
            for choice in response.choices {
                if let Some(content) = choice.message.content {
                    text.push_str(&content);
                }
            }
        }

        Ok(text)
    }

    fn streams(&self) -> bool {
        self.stream
    }
}

/// Convert a transcript message into the `async-openai` request type.
pub fn to_request_message(
    message: &Message,
) -> std::result::Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(match message {
        Message::System(text) => ChatCompletionRequestSystemMessageArgs::default()
            .content(text.as_str())
            .build()?
            .into(),
        Message::User(text) => ChatCompletionRequestUserMessageArgs::default()
            .content(text.as_str())
            .build()?
            .into(),
        Message::Assistant(text) => ChatCompletionRequestAssistantMessageArgs::default()
            .content(text.as_str())
            .build()?
            .into(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::observer::{NullObserver, Recorded, Recorder};
    use httpmock::prelude::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Backend that replays scripted results and records every request.
    pub(crate) struct ScriptedBackend {
        pub(crate) replies: RefCell<VecDeque<Result<String>>>,
        pub(crate) requests: Rc<RefCell<Vec<CompletionRequest>>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(
            replies: Vec<Result<String>>,
        ) -> (Self, Rc<RefCell<Vec<CompletionRequest>>>) {
            let requests = Rc::new(RefCell::new(Vec::new()));
            let backend = Self {
                replies: RefCell::new(replies.into()),
                requests: requests.clone(),
            };
            (backend, requests)
        }
    }

    #[async_trait(?Send)]
    impl ChatBackend for ScriptedBackend {
        async fn send(
            &self,
            request: &CompletionRequest,
            _observer: &mut dyn Observer,
        ) -> Result<String> {
            self.requests.borrow_mut().push(request.clone());
            self.replies.borrow_mut().pop_front().unwrap_or_else(|| {
                Err(GreptError::Service {
                    attempts: 1,
                    message: "connection refused".to_string(),
                })
            })
        }
    }

    pub(crate) fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn open_turn(question: &str) -> Conversation {
        let mut history = Conversation::new();
        history.push_user(question).unwrap();
        history
    }

    #[tokio::test]
    async fn test_message_order() {
        let (backend, requests) = ScriptedBackend::new(vec![Ok("It prints.".to_string())]);
        let client = CompletionClient::with_backend(Box::new(backend), true, fast_retry(2));
        let mut history = Conversation::new();
        history.push_user("first").unwrap();
        history.push_assistant("one").unwrap();
        history.push_user("second").unwrap();
        let context = vec![Message::System("FILE: a.rs\nfn a() {}\n".to_string())];

        let completion = client
            .complete("be brief", &context, &mut history, 64, &mut NullObserver)
            .await;

        assert!(completion.succeeded());
        assert_eq!(completion.text, "It prints.");
        let sent = &requests.borrow()[0];
        assert_eq!(sent.max_tokens, 64);
        assert_eq!(
            sent.messages,
            vec![
                Message::System("be brief".to_string()),
                Message::System("FILE: a.rs\nfn a() {}\n".to_string()),
                Message::User("first".to_string()),
                Message::Assistant("one".to_string()),
                Message::User("second".to_string()),
            ]
        );
        assert_eq!(history.last_reply(), Some("It prints."));
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_every_attempt_fails() {
        let (backend, requests) = ScriptedBackend::new(vec![]);
        let client = CompletionClient::with_backend(Box::new(backend), true, fast_retry(2));
        let mut history = open_turn("why?");
        let mut recorder = Recorder::default();

        let completion = client
            .complete("sys", &[], &mut history, 16, &mut recorder)
            .await;

        assert_eq!(completion.text, "");
        assert!(!completion.succeeded());
        assert!(matches!(
            completion.error,
            Some(GreptError::Service { attempts: 2, .. })
        ));
        assert_eq!(requests.borrow().len(), 2);
        assert_eq!(history.messages().last(), Some(&Message::Assistant(String::new())));
        assert_eq!(history.len(), 2);
        assert!(recorder.seen.contains(&Recorded::RetryScheduled(1)));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (backend, requests) = ScriptedBackend::new(vec![
            Err(GreptError::Service {
                attempts: 1,
                message: "502".to_string(),
            }),
            Ok("recovered".to_string()),
        ]);
        let client = CompletionClient::with_backend(Box::new(backend), true, fast_retry(3));
        let mut history = open_turn("again?");

        let completion = client
            .complete("sys", &[], &mut history, 16, &mut NullObserver)
            .await;

        assert_eq!(completion.text, "recovered");
        assert_eq!(requests.borrow().len(), 2);
    }

    /// Streams "Hel", "lo" and drops the connection on the first call, then
    /// streams the whole reply.
    struct FlakyStream {
        calls: RefCell<u32>,
    }

    #[async_trait(?Send)]
    impl ChatBackend for FlakyStream {
        async fn send(
            &self,
            _request: &CompletionRequest,
            observer: &mut dyn Observer,
        ) -> Result<String> {
            *self.calls.borrow_mut() += 1;
            if *self.calls.borrow() == 1 {
                observer.notice(Notice::Fragment("Hel"));
                observer.notice(Notice::Fragment("lo"));
                return Err(GreptError::Service {
                    attempts: 1,
                    message: "stream closed".to_string(),
                });
            }
            observer.notice(Notice::Fragment("Hello"));
            Ok("Hello".to_string())
        }

        fn streams(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_failed_stream_fragments_are_discarded() {
        let backend = FlakyStream {
            calls: RefCell::new(0),
        };
        let client = CompletionClient::with_backend(Box::new(backend), true, fast_retry(2));
        let mut history = open_turn("greet me");
        let mut recorder = Recorder::default();

        let completion = client
            .complete("sys", &[], &mut history, 16, &mut recorder)
            .await;

        assert_eq!(completion.text, "Hello");
        assert_eq!(
            recorder.seen,
            vec![
                Recorded::Fragment("Hel".to_string()),
                Recorded::Fragment("lo".to_string()),
                Recorded::PartialDiscarded(2),
                Recorded::RetryScheduled(1),
                Recorded::Fragment("Hello".to_string()),
                Recorded::Reply("Hello".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_credential_is_not_retried() {
        let (backend, requests) = ScriptedBackend::new(vec![Ok("unused".to_string())]);
        let client = CompletionClient::with_backend(Box::new(backend), false, fast_retry(2));
        let mut history = open_turn("hello?");

        let completion = client
            .complete("sys", &[], &mut history, 16, &mut NullObserver)
            .await;

        assert!(matches!(completion.error, Some(GreptError::Credential)));
        assert!(requests.borrow().is_empty());
        assert_eq!(history.last_reply(), Some(""));
    }

    fn http_config(server: &MockServer, stream: bool) -> GreptConfig {
        GreptConfig {
            api_key: Some("test-key".to_string()),
            api_base: server.base_url(),
            model: "gpt-3.5-turbo".to_string(),
            should_stream: Some(stream),
            max_retries: 2,
            retry_delay_ms: 0,
            request_timeout_secs: 10,
            ..GreptConfig::default()
        }
    }

    const COMPLETION_BODY: &str = r#"{
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello world"},
            "finish_reason": "stop",
            "logprobs": null
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
    }"#;

    fn stream_body() -> String {
        ["Hello", " world"]
            .iter()
            .map(|piece| {
                format!(
                    "data: {{\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"gpt-3.5-turbo\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{piece}\"}},\"finish_reason\":null}}]}}\n\n"
                )
            })
            .chain(std::iter::once("data: [DONE]\n\n".to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_openai_backend_modes_agree() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .body_includes("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(stream_body());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_excludes("\"stream\":true");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(COMPLETION_BODY);
            })
            .await;

        let single = CompletionClient::new(&http_config(&server, false)).unwrap();
        let mut history = open_turn("say hello");
        let single_shot = single
            .complete("sys", &[], &mut history, 16, &mut NullObserver)
            .await;

        let streaming = CompletionClient::new(&http_config(&server, true)).unwrap();
        let mut history = open_turn("say hello");
        let mut recorder = Recorder::default();
        let streamed = streaming
            .complete("sys", &[], &mut history, 16, &mut recorder)
            .await;

        assert_eq!(single_shot.text, "Hello world");
        assert_eq!(streamed.text, single_shot.text);
        assert!(recorder.seen.contains(&Recorded::Fragment("Hello".to_string())));
        assert!(
            recorder
                .seen
                .contains(&Recorded::Reply("Hello world".to_string(), true))
        );
    }

    #[tokio::test]
    async fn test_openai_backend_rejected_request() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(400)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"message":"bad request","type":"invalid_request_error","param":null,"code":null}}"#);
            })
            .await;

        let client = CompletionClient::new(&http_config(&server, false)).unwrap();
        let mut history = open_turn("hello?");
        let mut recorder = Recorder::default();
        let completion = client
            .complete("sys", &[], &mut history, 16, &mut recorder)
            .await;

        assert!(matches!(
            completion.error,
            Some(GreptError::Service { attempts: 2, .. })
        ));
        assert_eq!(history.last_reply(), Some(""));
        assert_eq!(
            recorder
                .seen
                .iter()
                .filter(|r| matches!(r, Recorded::RetryScheduled(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_to_request_message_roles() {
        let user = to_request_message(&Message::User("hi".to_string())).unwrap();
        assert!(matches!(user, ChatCompletionRequestMessage::User(_)));
        let system = to_request_message(&Message::System("s".to_string())).unwrap();
        assert!(matches!(system, ChatCompletionRequestMessage::System(_)));
        let assistant = to_request_message(&Message::Assistant("a".to_string())).unwrap();
        assert!(matches!(assistant, ChatCompletionRequestMessage::Assistant(_)));
    }
}
