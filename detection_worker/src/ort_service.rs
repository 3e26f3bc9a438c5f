use crate::{
    codec::PixelGrid,
    config::{Device, ModelConfig, Validatable},
    model_service::{DetectionModel, InferenceError, RawDetection},
};
use image::imageops::{self, FilterType};
use ndarray::{Array, ArrayViewD, Axis, Ix2, Ix4};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::PathBuf;
use thiserror::Error;

const BOX_FIELDS: usize = 4;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("model {0:?} declares no outputs")]
    MissingOutput(PathBuf),
}

impl From<ort::Error> for InferenceError {
    fn from(err: ort::Error) -> Self {
        InferenceError::Runtime(err.to_string())
    }
}

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let height = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    width.max(0.) * height.max(0.)
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn execution_provider(device: Device) -> ExecutionProviderDispatch {
    match device {
        Device::Cpu => CPUExecutionProvider::default().build(),
        Device::Cuda(device_id) => CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure(),
        Device::TensorRt(device_id) => TensorRTExecutionProvider::default()
            .with_device_id(device_id)
            .with_engine_cache(true)
            .build()
            .error_on_failure(),
    }
}

fn transform_pixel_grid(
    pixels: &PixelGrid,
    input_size: u32,
) -> Result<Array<f32, Ix4>, InferenceError> {
    let img = pixels.to_rgb_image().ok_or_else(|| {
        InferenceError::InvalidInput(format!(
            "pixel grid of {}x{} does not form an RGB image",
            pixels.width(),
            pixels.height()
        ))
    })?;
    if img.width() == 0 || img.height() == 0 {
        return Err(InferenceError::InvalidInput("image has no pixels".to_string()));
    }
    let img = imageops::resize(&img, input_size, input_size, FilterType::CatmullRom);

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(input)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PostProcessing {
    pub input_size: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: Option<usize>,
}

impl PostProcessing {
    pub(crate) fn apply(
        &self,
        output: ArrayViewD<'_, f32>,
        img_width: usize,
        img_height: usize,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_FIELDS {
            return Err(InferenceError::UnexpectedOutputShape(shape));
        }

        let x_scale = img_width as f32 / self.input_size as f32;
        let y_scale = img_height as f32 / self.input_size as f32;
        let predictions = output
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|_| InferenceError::UnexpectedOutputShape(shape.clone()))?;

        let mut boxes = Vec::new();
        for anchor in predictions.axis_iter(Axis(1)) {
            let best = anchor
                .iter()
                .skip(BOX_FIELDS)
                .copied()
                .enumerate()
                .filter(|(_, score)| !score.is_nan())
                .reduce(|accum, candidate| {
                    if candidate.1 > accum.1 {
                        candidate
                    } else {
                        accum
                    }
                });
            let Some((class_index, score)) = best else {
                continue;
            };

            if score < self.score_threshold {
                continue;
            }

            let xc = anchor[0] * x_scale;
            let yc = anchor[1] * y_scale;
            let w = anchor[2] * x_scale;
            let h = anchor[3] * y_scale;
            if ![xc, yc, w, h].iter().all(|value| value.is_finite()) {
                continue;
            }

            boxes.push(RawDetection {
                class_index,
                score,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        boxes.sort_by(|box1, box2| box2.score.total_cmp(&box1.score));

        let mut result: Vec<RawDetection> = Vec::new();
        for candidate in boxes {
            if self.max_detections.is_some_and(|max| result.len() >= max) {
                break;
            }
            if result
                .iter()
                .all(|kept| iou(kept, &candidate) < self.iou_threshold)
            {
                result.push(candidate);
            }
        }

        Ok(result)
    }
}

pub struct OrtDetector {
    session: Session,
    output_name: String,
    num_classes: Option<usize>,
    post_processing: PostProcessing,
}

impl OrtDetector {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelLoadError> {
        let model_path = model_config.get_path();
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([execution_provider(model_config.device)])?
            .commit_from_file(&model_path)?;

        let output = session
            .outputs
            .first()
            .ok_or_else(|| ModelLoadError::MissingOutput(model_path.clone()))?;
        let output_name = output.name.clone();
        let num_classes = output
            .output_type
            .tensor_shape()
            .and_then(|shape| shape.get(1).copied())
            .filter(|dim| *dim > BOX_FIELDS as i64)
            .map(|dim| dim as usize - BOX_FIELDS);

        tracing::info!(
            profile = %model_config.profile,
            device = ?model_config.device,
            path = ?model_path,
            num_classes = ?num_classes,
            "Loaded ONNX session"
        );

        Ok(Self {
            session,
            output_name,
            num_classes,
            post_processing: PostProcessing {
                input_size: model_config.input_size,
                score_threshold: model_config.score_threshold,
                iou_threshold: model_config.iou_threshold,
                max_detections: model_config.max_detections,
            },
        })
    }

    fn run_inference(
        &mut self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, InferenceError> {
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        let ix = shape.to_ixdyn();
        ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| InferenceError::Runtime(format!("invalid tensor shape: {}", e)))
    }
}

impl DetectionModel for OrtDetector {
    fn detect(&mut self, pixels: &PixelGrid) -> Result<Vec<RawDetection>, InferenceError> {
        let input = transform_pixel_grid(pixels, self.post_processing.input_size)?;
        let output = self.run_inference(&input)?;

        self.post_processing
            .apply(output.view(), pixels.width(), pixels.height())
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}
