use crate::{
    config::NatsConfig,
    dispatcher::RequestQueue,
    encoder::{DetectionResponse, ErrorReply},
};
use async_nats::{Client, ConnectOptions, HeaderMap, Message, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;

const SERVICE_ERROR_HEADER: &str = "Nats-Service-Error";
const SERVICE_ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("failed to publish reply to {reply_to}: {reason}")]
    Publish { reply_to: String, reason: String },
    #[error("failed to serialize reply: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Detections(DetectionResponse),
    Failure(ErrorReply),
}

#[async_trait]
pub trait ReplySink: Send + Sync + Clone + 'static {
    async fn send(&self, reply_to: &str, reply: Reply) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct NatsReplySink {
    client: Client,
}

impl NatsReplySink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn service_error_description(kind: &str) -> &'static str {
    match kind {
        "decode_error" => "Error decoding image",
        "inference_error" => "Error running inference",
        "unknown_class_index" => "Error mapping detections to class names",
        "shutting_down" => "Service is shutting down",
        _ => "Internal error",
    }
}

fn reply_message(reply: &Reply) -> Result<(Option<HeaderMap>, Bytes), TransportError> {
    match reply {
        Reply::Detections(response) => Ok((None, response.to_json()?.into())),
        Reply::Failure(error_reply) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                SERVICE_ERROR_HEADER,
                service_error_description(&error_reply.error.kind),
            );
            headers.insert(
                SERVICE_ERROR_CODE_HEADER,
                error_reply.error.code.to_string().as_str(),
            );
            Ok((Some(headers), error_reply.to_json()?.into()))
        }
    }
}

#[async_trait]
impl ReplySink for NatsReplySink {
    async fn send(&self, reply_to: &str, reply: Reply) -> Result<(), TransportError> {
        let (headers, payload) = reply_message(&reply)?;
        let published = match headers {
            Some(headers) => {
                self.client
                    .publish_with_headers(reply_to.to_string(), headers, payload)
                    .await
            }
            None => self.client.publish(reply_to.to_string(), payload).await,
        };
        published.map_err(|e| TransportError::Publish {
            reply_to: reply_to.to_string(),
            reason: e.to_string(),
        })
    }
}

pub async fn connect(nats_config: &NatsConfig) -> Result<Client, TransportError> {
    let connect_error = |reason: String| TransportError::Connect {
        url: nats_config.url.clone(),
        reason,
    };

    let mut options = ConnectOptions::new().name(&nats_config.client_name);
    if let Some(credentials_file) = &nats_config.credentials_file {
        options = options
            .credentials_file(credentials_file)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
    }

    let client = options
        .connect(nats_config.url.as_str())
        .await
        .map_err(|e| connect_error(e.to_string()))?;

    tracing::info!(url = %nats_config.url, "Connected to nats-server");
    Ok(client)
}

fn queue_group(nats_config: &NatsConfig) -> Option<String> {
    nats_config
        .queue_group
        .clone()
        .filter(|group| !group.is_empty())
}

fn split_message(message: Message) -> (Bytes, Option<String>) {
    (message.payload, message.reply.map(|subject| subject.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    Shutdown,
    Closed,
}

async fn forward_until_shutdown<S, R>(
    mut messages: S,
    queue: &mut RequestQueue<R>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Stopped
where
    S: Stream<Item = (Bytes, Option<String>)> + Unpin,
    R: ReplySink,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Stopped::Shutdown,
            message = messages.next() => match message {
                Some((payload, reply_to)) => queue.submit(payload, reply_to).await,
                None => return Stopped::Closed,
            },
        }
    }
}

async fn forward_remaining<S, R>(mut messages: S, queue: &mut RequestQueue<R>) -> usize
where
    S: Stream<Item = (Bytes, Option<String>)> + Unpin,
    R: ReplySink,
{
    let mut forwarded = 0;
    while let Some((payload, reply_to)) = messages.next().await {
        queue.submit(payload, reply_to).await;
        forwarded += 1;
    }
    forwarded
}

pub struct Listener<R: ReplySink> {
    subscriber: Subscriber,
    subject: String,
    queue: RequestQueue<R>,
}

impl<R: ReplySink> Listener<R> {
    pub async fn subscribe(
        client: &Client,
        nats_config: &NatsConfig,
        queue: RequestQueue<R>,
    ) -> Result<Self, TransportError> {
        let subject = nats_config.subject.clone();

        let subscribed = match queue_group(nats_config) {
            Some(group) => client.queue_subscribe(subject.clone(), group).await,
            None => client.subscribe(subject.clone()).await,
        };
        let subscriber = subscribed.map_err(|e| TransportError::Subscribe {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(subject = %subject, "Listening for detection requests");
        Ok(Self {
            subscriber,
            subject,
            queue,
        })
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let stopped = forward_until_shutdown(
            self.subscriber.by_ref().map(split_message),
            &mut self.queue,
            &mut shutdown_rx,
        )
        .await;

        match stopped {
            Stopped::Shutdown => {
                tracing::info!(subject = %self.subject, "Listener received shutdown signal");
                // Messages buffered before the unsubscribe still need a reply.
                if let Err(e) = self.subscriber.unsubscribe().await {
                    tracing::warn!(subject = %self.subject, error = %e, "Failed to unsubscribe");
                }
                let drained =
                    forward_remaining(self.subscriber.by_ref().map(split_message), &mut self.queue)
                        .await;
                tracing::info!(subject = %self.subject, drained, "Drained buffered requests");
            }
            Stopped::Closed => {
                tracing::warn!(subject = %self.subject, "Subscription closed by the server");
            }
        }
        tracing::info!(subject = %self.subject, "Listener stopped");
    }
}
