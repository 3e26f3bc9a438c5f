mod app;
mod codec;
mod dispatcher;
mod encoder;
mod model_service;
mod ort_service;
mod taxonomy;
mod transport;

pub mod config;

pub use app::{start_worker, StartupError};
pub use codec::{decode, DecodeError, PixelGrid};
pub use dispatcher::{DispatchError, DispatchStats, Dispatcher, Pipeline, RequestQueue};
pub use encoder::{encode, BoundingBoxRecord, DetectionResponse, ErrorReply, UnknownClassIndexError};
pub use model_service::{DetectionModel, InferenceError, ModelHandle, RawDetection};
pub use ort_service::{ModelLoadError, OrtDetector};
pub use taxonomy::{Taxonomy, TaxonomyError};
pub use transport::{Reply, ReplySink, TransportError};
