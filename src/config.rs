use crate::state::DEFAULT_SPEED;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{debug, error};

/// Which engine runs the autonomous classifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Compiled int8 model executed in the fixed arena.
    #[default]
    Arena,
    /// Float ONNX model executed by candle.
    Onnx,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address of the teleop surface.
    pub bind: String,
    pub stream_interval_ms: u64,
    pub client_write_timeout_ms: u64,
    pub default_speed: u8,
    pub jpeg_quality: u8,
    pub camera_index: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Replay images from this directory instead of opening a camera.
    pub frames_dir: Option<PathBuf>,
    pub crop: u32,
    pub channels: usize,
    pub arena_bytes: usize,
    pub engine: Engine,
    pub model_path: PathBuf,
    pub onnx_model: String,
    pub onnx_repo: Option<String>,
    pub onnx_output_scale: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:80".to_string(),
            stream_interval_ms: 40,
            client_write_timeout_ms: 2000,
            default_speed: DEFAULT_SPEED,
            jpeg_quality: 80,
            camera_index: 0,
            frame_width: 320,
            frame_height: 240,
            frames_dir: None,
            crop: 96,
            channels: 3,
            arena_bytes: 64 * 1024,
            engine: Engine::Arena,
            model_path: PathBuf::from("drive.rvqm"),
            onnx_model: "drive.onnx".to_string(),
            onnx_repo: None,
            onnx_output_scale: 0.1,
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("ROVER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rover.json"))
}

pub fn load_config() -> Config {
    let path = config_path();
    if let Ok(data) = fs::read(&path) {
        match serde_json::from_slice(&data) {
            Ok(cfg) => {
                debug!(path = %path.display(), "configuration loaded");
                return cfg;
            }
            Err(e) => error!("ignoring invalid config {}: {e}", path.display()),
        }
    }
    Config::default()
}

pub fn save_config(cfg: &Config) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(cfg) {
        Ok(data) => {
            if let Err(e) = fs::write(&path, data) {
                error!("failed to write config: {e}");
            }
        }
        Err(e) => error!("failed to encode config: {e}"),
    }
}
