use crate::{
    codec::{self, DecodeError},
    encoder::{self, DetectionResponse, ErrorReply, UnknownClassIndexError},
    model_service::{DetectionModel, InferenceError, ModelHandle},
    taxonomy::Taxonomy,
    transport::{Reply, ReplySink},
};
use bytes::Bytes;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    UnknownClassIndex(#[from] UnknownClassIndexError),
    #[error("inference task failed: {0}")]
    TaskFailed(String),
    #[error("worker is shutting down; request was not processed")]
    ShuttingDown,
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Decode(_) => "decode_error",
            DispatchError::Inference(_) | DispatchError::TaskFailed(_) => "inference_error",
            DispatchError::UnknownClassIndex(_) => "unknown_class_index",
            DispatchError::ShuttingDown => "shutting_down",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DispatchError::Decode(_) => 400,
            DispatchError::Inference(_)
            | DispatchError::TaskFailed(_)
            | DispatchError::UnknownClassIndex(_) => 500,
            DispatchError::ShuttingDown => 503,
        }
    }

    fn to_reply(&self, request_id: u64) -> Reply {
        Reply::Failure(ErrorReply::new(
            request_id,
            self.kind(),
            self.code(),
            self.to_string(),
        ))
    }
}

#[derive(Debug)]
pub struct DetectionRequest {
    pub id: u64,
    pub payload: Bytes,
    pub reply_to: String,
    pub received_at: Instant,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub response: DetectionResponse,
    pub inference_time: Duration,
}

pub struct Pipeline<M: DetectionModel> {
    model: Arc<ModelHandle<M>>,
    taxonomy: Arc<Taxonomy>,
}

impl<M: DetectionModel> Clone for Pipeline<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            taxonomy: self.taxonomy.clone(),
        }
    }
}

impl<M: DetectionModel> Pipeline<M> {
    pub fn new(model: Arc<ModelHandle<M>>, taxonomy: Arc<Taxonomy>) -> Self {
        Self { model, taxonomy }
    }

    pub fn run(&self, payload: &[u8]) -> Result<PipelineOutput, DispatchError> {
        let pixels = codec::decode(payload)?;

        let start_time = Instant::now();
        let detections = self.model.detect(&pixels)?;
        let inference_time = start_time.elapsed();

        let response = encoder::encode(&detections, &self.taxonomy)?;
        Ok(PipelineOutput {
            response,
            inference_time,
        })
    }
}

pub struct RequestQueue<R: ReplySink> {
    requests: mpsc::UnboundedSender<DetectionRequest>,
    replies: R,
    next_id: u64,
}

impl<R: ReplySink> RequestQueue<R> {
    pub async fn submit(&mut self, payload: Bytes, reply_to: Option<String>) {
        self.next_id += 1;
        let id = self.next_id;

        let Some(reply_to) = reply_to else {
            tracing::warn!(request_id = id, "Dropping detection request without a reply subject");
            return;
        };

        tracing::debug!(request_id = id, bytes = payload.len(), "Received detection request");
        let request = DetectionRequest {
            id,
            payload,
            reply_to,
            received_at: Instant::now(),
        };

        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            abandon(&self.replies, request).await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub served: u64,
    pub failed: u64,
    pub abandoned: u64,
}

pub struct Dispatcher<M: DetectionModel, R: ReplySink> {
    pipeline: Pipeline<M>,
    requests: mpsc::UnboundedReceiver<DetectionRequest>,
    replies: R,
    stats: DispatchStats,
}

impl<M: DetectionModel, R: ReplySink> Dispatcher<M, R> {
    pub fn new(pipeline: Pipeline<M>, replies: R) -> (Self, RequestQueue<R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = RequestQueue {
            requests: tx,
            replies: replies.clone(),
            next_id: 0,
        };
        let dispatcher = Self {
            pipeline,
            requests: rx,
            replies,
            stats: DispatchStats::default(),
        };
        (dispatcher, queue)
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> DispatchStats {
        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Dispatcher received shutdown signal");
                    break;
                }
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.dispatch(request).await;
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            abandon(&self.replies, request).await;
            self.stats.abandoned += 1;
        }

        tracing::info!(
            served = self.stats.served,
            failed = self.stats.failed,
            abandoned = self.stats.abandoned,
            "Dispatcher stopped"
        );
        self.stats
    }

    async fn dispatch(&mut self, request: DetectionRequest) {
        let DetectionRequest {
            id,
            payload,
            reply_to,
            received_at,
        } = request;

        let pipeline = self.pipeline.clone();
        let outcome = tokio::task::spawn_blocking(move || pipeline.run(&payload))
            .await
            .unwrap_or_else(|e| Err(DispatchError::TaskFailed(e.to_string())));

        let reply = match outcome {
            Ok(output) => {
                self.stats.served += 1;
                tracing::info!(
                    request_id = id,
                    detections = output.response.len(),
                    inference_ms = output.inference_time.as_millis() as u64,
                    total_ms = received_at.elapsed().as_millis() as u64,
                    "Detection request served"
                );
                Reply::Detections(output.response)
            }
            Err(err) => {
                self.stats.failed += 1;
                tracing::error!(
                    request_id = id,
                    kind = err.kind(),
                    error = %err,
                    "Detection request failed"
                );
                err.to_reply(id)
            }
        };

        if let Err(e) = self.replies.send(&reply_to, reply).await {
            tracing::error!(request_id = id, error = %e, "Failed to send reply");
        }
    }
}

async fn abandon<R: ReplySink>(replies: &R, request: DetectionRequest) {
    let err = DispatchError::ShuttingDown;
    tracing::warn!(request_id = request.id, kind = err.kind(), "Abandoning queued request");
    if let Err(e) = replies.send(&request.reply_to, err.to_reply(request.id)).await {
        tracing::error!(request_id = request.id, error = %e, "Failed to send reply");
    }
}
