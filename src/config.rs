use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MARGIN: u32 = 40;
const DEFAULT_MULTI_LABEL_IOU_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_DETECTIONS: usize = 10;
const DEFAULT_IMAGE_SIZE: u32 = 640;
const DEFAULT_INPUT_EXTENSION: &str = ".jpg";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_QUEUE_RETRIES: u32 = 10;
const DEFAULT_OUTPUT_DIR: &str = "output";
const MQTT_TLS_PORT: u16 = 8883;
const MQTT_DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    models: Option<ModelsConfigFile>,
    input: Option<InputConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    flower: Option<ModelConfigFile>,
    pollinator: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    weights_path: Option<String>,
    class_names: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    margin: Option<u32>,
    multi_label: Option<bool>,
    multi_label_iou_threshold: Option<f32>,
    max_detections: Option<usize>,
    augment: Option<bool>,
    image_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct InputConfigFile {
    #[serde(rename = "type")]
    kind: Option<String>,
    directory: Option<DirectoryConfigFile>,
    message_queue: Option<QueueConfigFile>,
    remove_after_processing: Option<bool>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DirectoryConfigFile {
    base_dir: Option<PathBuf>,
    extension: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    url: Option<String>,
    #[serde(alias = "request_timeout")]
    request_timeout_ms: Option<u64>,
    request_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    ignore_empty_results: Option<bool>,
    file: Option<FileOutputConfigFile>,
    mqtt: Option<MqttOutputConfigFile>,
    http: Option<HttpOutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FileOutputConfigFile {
    store_file: Option<bool>,
    base_dir: Option<PathBuf>,
    save_crops: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttOutputConfigFile {
    transmit_mqtt: Option<bool>,
    broker: Option<String>,
    /// `host` and `port` are accepted in place of `broker`.
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpOutputConfigFile {
    transmit_http: Option<bool>,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    method: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub flower: ModelSettings,
    pub pollinator: ModelSettings,
    pub input: InputSettings,
    pub output: OutputSettings,
}

/// Settings of one detector stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub weights_path: String,
    /// File name of the weights, reported in result metadata.
    pub model_name: String,
    pub class_names: Option<Vec<String>>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub margin: u32,
    pub multi_label: bool,
    pub multi_label_iou_threshold: f32,
    pub max_detections: usize,
    pub augment: bool,
    pub image_size: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            weights_path: String::new(),
            model_name: String::new(),
            class_names: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            margin: DEFAULT_MARGIN,
            multi_label: false,
            multi_label_iou_threshold: DEFAULT_MULTI_LABEL_IOU_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            augment: false,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Directory(DirectorySettings),
    MessageQueue(QueueSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySettings {
    pub base_dir: PathBuf,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub url: String,
    pub request_timeout: Duration,
    pub request_retries: u32,
}

#[derive(Debug, Clone)]
pub struct InputSettings {
    pub source: InputSource,
    pub remove_after_processing: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct OutputSettings {
    pub ignore_empty_results: bool,
    pub file: Option<FileOutputSettings>,
    pub mqtt: Option<MqttOutputSettings>,
    pub http: Option<HttpOutputSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutputSettings {
    pub base_dir: PathBuf,
    pub save_crops: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOutputSettings {
    /// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
    pub broker: String,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `None` enables TLS only for the conventional TLS port.
    pub use_tls: Option<bool>,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

impl MqttOutputSettings {
    pub fn tls_enabled_for_port(&self, port: u16) -> bool {
        self.use_tls.unwrap_or(port == MQTT_TLS_PORT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            other => Err(anyhow!(
                "unsupported HTTP method '{}': expected POST or PUT",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOutputSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub method: HttpMethod,
}

impl PipelineConfig {
    /// Load from `POLLINATOR_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("POLLINATOR_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit path, or from defaults when `path` is `None`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let models = file.models.unwrap_or_default();
        let flower = model_settings(models.flower.unwrap_or_default());
        let pollinator = model_settings(models.pollinator.unwrap_or_default());

        let input = file.input.unwrap_or_default();
        let source = match input.kind.as_deref().unwrap_or("directory") {
            "directory" => {
                let dir = input.directory.unwrap_or_default();
                InputSource::Directory(DirectorySettings {
                    base_dir: dir.base_dir.unwrap_or_default(),
                    extension: dir
                        .extension
                        .unwrap_or_else(|| DEFAULT_INPUT_EXTENSION.to_string()),
                })
            }
            "message_queue" => {
                let queue = input.message_queue.unwrap_or_default();
                InputSource::MessageQueue(QueueSettings {
                    url: queue.url.unwrap_or_default(),
                    request_timeout: Duration::from_millis(
                        queue.request_timeout_ms.unwrap_or(DEFAULT_QUEUE_TIMEOUT_MS),
                    ),
                    request_retries: queue.request_retries.unwrap_or(DEFAULT_QUEUE_RETRIES),
                })
            }
            other => {
                return Err(anyhow!(
                    "unknown input type '{}': expected 'directory' or 'message_queue'",
                    other
                ))
            }
        };
        let input = InputSettings {
            source,
            remove_after_processing: input.remove_after_processing.unwrap_or(false),
            poll_interval: Duration::from_secs(
                input.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
        };

        let output = file.output.unwrap_or_default();
        let file_sink = output
            .file
            .filter(|file| file.store_file.unwrap_or(false))
            .map(|file| FileOutputSettings {
                base_dir: file
                    .base_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                save_crops: file.save_crops.unwrap_or(true),
            });
        let mqtt = output
            .mqtt
            .filter(|mqtt| mqtt.transmit_mqtt.unwrap_or(false))
            .map(|mqtt| MqttOutputSettings {
                broker: mqtt_broker(mqtt.broker, mqtt.host, mqtt.port),
                topic: mqtt.topic.unwrap_or_default(),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls,
                ca_path: mqtt.ca_path,
                client_cert_path: mqtt.client_cert_path,
                client_key_path: mqtt.client_key_path,
            });
        let http = match output
            .http
            .filter(|http| http.transmit_http.unwrap_or(false))
        {
            Some(http) => Some(HttpOutputSettings {
                url: http.url.unwrap_or_default(),
                username: http.username,
                password: http.password,
                method: http.method.as_deref().unwrap_or("POST").parse()?,
            }),
            None => None,
        };

        Ok(Self {
            flower,
            pollinator,
            input,
            output: OutputSettings {
                ignore_empty_results: output.ignore_empty_results.unwrap_or(false),
                file: file_sink,
                mqtt,
                http,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("POLLINATOR_INPUT_DIR") {
            if !dir.trim().is_empty() {
                match &mut self.input.source {
                    InputSource::Directory(settings) => settings.base_dir = PathBuf::from(dir),
                    InputSource::MessageQueue(_) => {
                        log::warn!("POLLINATOR_INPUT_DIR ignored: input type is message_queue")
                    }
                }
            }
        }
        if let Ok(url) = std::env::var("POLLINATOR_QUEUE_URL") {
            if !url.trim().is_empty() {
                match &mut self.input.source {
                    InputSource::MessageQueue(settings) => settings.url = url,
                    InputSource::Directory(_) => {
                        log::warn!("POLLINATOR_QUEUE_URL ignored: input type is directory")
                    }
                }
            }
        }
        if let Ok(dir) = std::env::var("POLLINATOR_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                if let Some(file) = self.output.file.as_mut() {
                    file.base_dir = PathBuf::from(dir);
                }
            }
        }
        if let Ok(password) = std::env::var("POLLINATOR_MQTT_PASSWORD") {
            if let Some(mqtt) = self.output.mqtt.as_mut() {
                mqtt.password = Some(password);
            }
        }
        if let Ok(password) = std::env::var("POLLINATOR_HTTP_PASSWORD") {
            if let Some(http) = self.output.http.as_mut() {
                http.password = Some(password);
            }
        }
        if let Ok(interval) = std::env::var("POLLINATOR_POLL_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("POLLINATOR_POLL_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.input.poll_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_model("flower", &self.flower)?;
        validate_model("pollinator", &self.pollinator)?;

        match &self.input.source {
            InputSource::Directory(dir) => {
                if dir.base_dir.as_os_str().is_empty() {
                    return Err(anyhow!("input.directory.base_dir is required"));
                }
            }
            InputSource::MessageQueue(queue) => {
                if queue.url.trim().is_empty() {
                    return Err(anyhow!("input.message_queue.url is required"));
                }
                url::Url::parse(&queue.url)
                    .with_context(|| format!("invalid message queue url '{}'", queue.url))?;
                if queue.request_retries == 0 {
                    return Err(anyhow!("input.message_queue.request_retries must be at least 1"));
                }
            }
        }

        if let Some(mqtt) = &self.output.mqtt {
            if mqtt.broker.trim().is_empty() {
                return Err(anyhow!("output.mqtt.broker (or host) is required when transmit_mqtt is on"));
            }
            if mqtt.topic.trim().is_empty() {
                return Err(anyhow!("output.mqtt.topic is required when transmit_mqtt is on"));
            }
        }
        if let Some(http) = &self.output.http {
            if http.url.trim().is_empty() {
                return Err(anyhow!("output.http.url is required when transmit_http is on"));
            }
        }
        Ok(())
    }
}

fn model_settings(file: ModelConfigFile) -> ModelSettings {
    let defaults = ModelSettings::default();
    let weights_path = file.weights_path.unwrap_or_default();
    let model_name = weights_path
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    ModelSettings {
        model_name,
        weights_path,
        class_names: file.class_names,
        confidence_threshold: file
            .confidence_threshold
            .unwrap_or(defaults.confidence_threshold),
        iou_threshold: file.iou_threshold.unwrap_or(defaults.iou_threshold),
        margin: file.margin.unwrap_or(defaults.margin),
        multi_label: file.multi_label.unwrap_or(defaults.multi_label),
        multi_label_iou_threshold: file
            .multi_label_iou_threshold
            .unwrap_or(defaults.multi_label_iou_threshold),
        max_detections: file.max_detections.unwrap_or(defaults.max_detections),
        augment: file.augment.unwrap_or(defaults.augment),
        image_size: file.image_size.unwrap_or(defaults.image_size),
    }
}

fn validate_model(stage: &str, model: &ModelSettings) -> Result<()> {
    if model.weights_path.trim().is_empty() {
        return Err(anyhow!("models.{}.weights_path is required", stage));
    }
    for (name, value) in [
        ("confidence_threshold", model.confidence_threshold),
        ("iou_threshold", model.iou_threshold),
        ("multi_label_iou_threshold", model.multi_label_iou_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(anyhow!(
                "models.{}.{} must be within [0, 1], got {}",
                stage,
                name,
                value
            ));
        }
    }
    if model.image_size == 0 {
        return Err(anyhow!("models.{}.image_size must be greater than zero", stage));
    }
    if model.max_detections == 0 {
        return Err(anyhow!(
            "models.{}.max_detections must be greater than zero",
            stage
        ));
    }
    Ok(())
}

fn mqtt_broker(broker: Option<String>, host: Option<String>, port: Option<u16>) -> String {
    match (broker, host) {
        (Some(broker), _) => broker,
        (None, Some(host)) => {
            let port = port.unwrap_or(MQTT_DEFAULT_PORT);
            if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            }
        }
        (None, None) => String::new(),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
        _ => serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
    };
    Ok(cfg)
}
