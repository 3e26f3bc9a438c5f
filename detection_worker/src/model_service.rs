use crate::codec::PixelGrid;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference runtime failed: {0}")]
    Runtime(String),
    #[error("unexpected model output shape: {0:?}")]
    UnexpectedOutputShape(Vec<usize>),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("model lock poisoned by an earlier panic")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_index: usize,
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

pub trait DetectionModel: Send + 'static {
    fn detect(&mut self, pixels: &PixelGrid) -> Result<Vec<RawDetection>, InferenceError>;

    fn num_classes(&self) -> Option<usize>;
}

#[derive(Debug)]
pub struct ModelHandle<M: DetectionModel> {
    model: Mutex<M>,
    num_classes: Option<usize>,
}

impl<M: DetectionModel> ModelHandle<M> {
    pub fn new(model: M) -> Self {
        let num_classes = model.num_classes();
        Self {
            model: Mutex::new(model),
            num_classes,
        }
    }

    pub fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }

    pub fn detect(&self, pixels: &PixelGrid) -> Result<Vec<RawDetection>, InferenceError> {
        let mut model = self.model.lock().map_err(|_| InferenceError::Poisoned)?;
        model.detect(pixels)
    }
}
