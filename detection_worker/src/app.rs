use crate::{
    config::{Config, Validatable},
    dispatcher::{Dispatcher, Pipeline},
    model_service::{DetectionModel, ModelHandle},
    ort_service::{ModelLoadError, OrtDetector},
    taxonomy::{Taxonomy, TaxonomyError},
    transport::{self, Listener, NatsReplySink, TransportError},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{signal, sync::broadcast};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("failed to load taxonomy: {0}")]
    Taxonomy(#[from] TaxonomyError),
    #[error("failed to load model: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("startup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn start_worker(config: Config) -> Result<(), StartupError> {
    let taxonomy = Arc::new(Taxonomy::load(&config.labels.get_path())?);
    tracing::info!(classes = taxonomy.len(), "Loaded taxonomy");

    tracing::info!(profile = %config.model.profile, "Loading model...");
    let model_config = config.model.clone();
    let detector = tokio::task::spawn_blocking(move || OrtDetector::new(&model_config)).await??;
    let model = bind_model(detector, &taxonomy)?;

    let client = transport::connect(&config.nats).await?;
    let replies = NatsReplySink::new(client.clone());

    let (dispatcher, queue) = Dispatcher::new(Pipeline::new(model, taxonomy), replies);
    let listener = Listener::subscribe(&client, &config.nats, queue).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));
    let listener_handle = tokio::spawn(listener.run(shutdown_tx.subscribe()));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");
    let _ = shutdown_tx.send(());

    if let Err(e) = listener_handle.await {
        tracing::error!(error = %e, "Listener task failed");
    }
    match dispatcher_handle.await {
        Ok(stats) => tracing::info!(
            served = stats.served,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "All requests settled"
        ),
        Err(e) => tracing::error!(error = %e, "Dispatcher task failed"),
    }

    if let Err(e) = client.flush().await {
        tracing::warn!(error = %e, "Failed to flush pending replies");
    }
    drop(client);
    tracing::info!("Connection closed, exiting.");

    Ok(())
}

fn bind_model<M: DetectionModel>(
    model: M,
    taxonomy: &Taxonomy,
) -> Result<Arc<ModelHandle<M>>, StartupError> {
    let model = ModelHandle::new(model);
    taxonomy.validate_against(model.num_classes())?;
    Ok(Arc::new(model))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::PixelGrid,
        config::{Device, LabelsConfig, LogLevel, ModelConfig, NatsConfig},
        model_service::{InferenceError, RawDetection},
    };
    use std::path::PathBuf;

    #[derive(Debug)]
    struct FixedClasses(Option<usize>);

    impl DetectionModel for FixedClasses {
        fn detect(&mut self, _pixels: &PixelGrid) -> Result<Vec<RawDetection>, InferenceError> {
            Ok(vec![])
        }

        fn num_classes(&self) -> Option<usize> {
            self.0
        }
    }

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(vec!["person".to_string(), "car".to_string()]).unwrap()
    }

    fn config(labels_dir: PathBuf) -> Config {
        Config {
            log_level: LogLevel::Info,
            nats: NatsConfig {
                url: "nats://127.0.0.1:1".to_string(),
                subject: "detect".to_string(),
                queue_group: None,
                client_name: "detection_worker".to_string(),
                credentials_file: None,
            },
            model: ModelConfig {
                model_dir: PathBuf::from("models"),
                profile: "yolov8n".to_string(),
                weights_file: None,
                device: Device::Cpu,
                score_threshold: 0.85,
                iou_threshold: 0.7,
                input_size: 640,
                max_detections: None,
            },
            labels: LabelsConfig {
                labels_dir,
                labels_file: "detection_worker_missing_labels.txt".to_string(),
            },
        }
    }

    #[test]
    fn test_bind_model_rejects_cardinality_mismatch() {
        let err = bind_model(FixedClasses(Some(80)), &taxonomy()).unwrap_err();

        assert!(matches!(
            err,
            StartupError::Taxonomy(TaxonomyError::CardinalityMismatch {
                model: 80,
                taxonomy: 2
            })
        ));
    }

    #[test]
    fn test_bind_model_accepts_matching_or_unknown_cardinality() {
        let model = bind_model(FixedClasses(Some(2)), &taxonomy()).unwrap();
        assert_eq!(model.num_classes(), Some(2));

        assert!(bind_model(FixedClasses(None), &taxonomy()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_taxonomy_fails_before_connecting() {
        let err = start_worker(config(std::env::temp_dir())).await.unwrap_err();

        assert!(matches!(err, StartupError::Taxonomy(_)), "{}", err);
    }
}
