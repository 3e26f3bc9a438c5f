use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub nats: NatsConfig,
    pub model: ModelConfig,
    pub labels: LabelsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn deserialize_device<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn get_path(&self) -> PathBuf;
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: Option<String>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

fn default_subject() -> String {
    "detect".to_string()
}

fn default_queue_group() -> Option<String> {
    Some("detect".to_string())
}

fn default_client_name() -> String {
    "detection_worker".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub profile: String,
    #[serde(default)]
    pub weights_file: Option<String>,
    #[serde(default, deserialize_with = "deserialize_device")]
    pub device: Device,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub max_detections: Option<usize>,
}

fn default_score_threshold() -> f32 {
    0.85
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_input_size() -> u32 {
    640
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        match &self.weights_file {
            Some(file) => self.model_dir.join(file),
            None => self.model_dir.join(format!("{}.onnx", self.profile)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(format!(
                "score_threshold must be within [0, 1], got {}",
                self.score_threshold
            ));
        }
        if self.iou_threshold <= 0.0 || self.iou_threshold > 1.0 {
            return Err(format!(
                "iou_threshold must be within (0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.input_size == 0 {
            return Err("input_size must be greater than zero".to_string());
        }
        if self.max_detections == Some(0) {
            return Err("max_detections must be greater than zero when set".to_string());
        }
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_dir: PathBuf,
    pub labels_file: String,
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Labels file not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
    TensorRt(i32),
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let lowered = s.trim().to_lowercase();
        let (kind, index) = match lowered.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<i32>()
                    .map_err(|_| format!("{} is not a valid device index", index))?;
                (kind, index)
            }
            None => (lowered.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(index)),
            "tensorrt" => Ok(Self::TensorRt(index)),
            other => Err(format!(
                "{} is not a supported device. Use `cpu`, `cuda[:N]` or `tensorrt[:N]`.",
                other
            )),
        }
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("DETECT")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = settings.try_deserialize::<Config>()?;
    config
        .model
        .validate()
        .and_then(|_| config.labels.validate())
        .map_err(config::ConfigError::Message)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config(dir: PathBuf) -> ModelConfig {
        ModelConfig {
            model_dir: dir,
            profile: "yolov8n".to_string(),
            weights_file: None,
            device: Device::Cpu,
            score_threshold: 0.85,
            iou_threshold: 0.7,
            input_size: 640,
            max_detections: None,
        }
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!(Device::try_from("cpu".to_string()), Ok(Device::Cpu));
        assert_eq!(Device::try_from("CUDA".to_string()), Ok(Device::Cuda(0)));
        assert_eq!(
            Device::try_from("tensorrt:1".to_string()),
            Ok(Device::TensorRt(1))
        );
        assert!(Device::try_from("tpu".to_string()).is_err());
        assert!(Device::try_from("cuda:x".to_string()).is_err());
    }

    #[test]
    fn test_weights_path_defaults_to_profile() {
        let mut config = model_config(PathBuf::from("models"));
        assert_eq!(config.get_path(), PathBuf::from("models/yolov8n.onnx"));

        config.weights_file = Some("custom.onnx".to_string());
        assert_eq!(config.get_path(), PathBuf::from("models/custom.onnx"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_thresholds() {
        let dir = std::env::temp_dir();
        let mut config = model_config(dir.clone());
        config.weights_file = Some("detection_worker_missing.onnx".to_string());

        config.score_threshold = 1.5;
        assert!(config.validate().unwrap_err().contains("score_threshold"));

        config.score_threshold = 0.5;
        config.iou_threshold = 0.0;
        assert!(config.validate().unwrap_err().contains("iou_threshold"));

        config.iou_threshold = 0.7;
        assert!(config.validate().unwrap_err().contains("Model file not found"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert!(matches!(
            LogLevel::try_from("DEBUG".to_string()),
            Ok(LogLevel::Debug)
        ));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}
