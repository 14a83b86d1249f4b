use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;

use crate::{Backend, DetectionOptions, Error, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    pub detection: DetectionOptions,
    pub weights: Option<PathBuf>,
    pub backend: Backend,
    pub threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detection: DetectionOptions::default(),
            weights: None,
            backend: Backend::Native,
            threads: 4,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    detection: Option<DetectionSection>,
    model: Option<ModelSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectionSection {
    canvas_size: Option<u32>,
    mag_ratio: Option<f32>,
    text_threshold: Option<f32>,
    link_threshold: Option<f32>,
    low_text: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelSection {
    weights: Option<PathBuf>,
    backend: Option<Backend>,
    threads: Option<usize>,
}

/// Defaults, then `path` if given, then `CRAFT_*` environment variables.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    if let Some(path) = path {
        let content = fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read settings {}: {err}", path.display()))
        })?;
        settings.merge_toml(&content)?;
        log::debug!("Loaded settings from {}", path.display());
    }
    settings.apply_env(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| Error::Config(format!("{key}={value}: {err}")))
}

impl Settings {
    pub fn merge_toml(&mut self, content: &str) -> Result<()> {
        let file: SettingsFile =
            toml::from_str(content).map_err(|err| Error::Config(err.to_string()))?;
        if let Some(detection) = file.detection {
            let options = &mut self.detection;
            if let Some(value) = detection.canvas_size {
                options.canvas_size = value;
            }
            if let Some(value) = detection.mag_ratio {
                options.mag_ratio = value;
            }
            if let Some(value) = detection.text_threshold {
                options.text_threshold = value;
            }
            if let Some(value) = detection.link_threshold {
                options.link_threshold = value;
            }
            if let Some(value) = detection.low_text {
                options.low_text = value;
            }
        }
        if let Some(model) = file.model {
            if model.weights.is_some() {
                self.weights = model.weights;
            }
            if let Some(backend) = model.backend {
                self.backend = backend;
            }
            if let Some(threads) = model.threads {
                self.threads = threads;
            }
        }
        Ok(())
    }

    /// `lookup` resolves a variable name, normally to `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let options = &mut self.detection;
        if let Some(value) = lookup("CRAFT_CANVAS_SIZE") {
            options.canvas_size = parse_env("CRAFT_CANVAS_SIZE", &value)?;
        }
        if let Some(value) = lookup("CRAFT_MAG_RATIO") {
            options.mag_ratio = parse_env("CRAFT_MAG_RATIO", &value)?;
        }
        if let Some(value) = lookup("CRAFT_TEXT_THRESHOLD") {
            options.text_threshold = parse_env("CRAFT_TEXT_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("CRAFT_LINK_THRESHOLD") {
            options.link_threshold = parse_env("CRAFT_LINK_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("CRAFT_LOW_TEXT") {
            options.low_text = parse_env("CRAFT_LOW_TEXT", &value)?;
        }
        if let Some(value) = lookup("CRAFT_WEIGHTS") {
            self.weights = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("CRAFT_BACKEND") {
            self.backend = parse_env("CRAFT_BACKEND", &value)?;
        }
        if let Some(value) = lookup("CRAFT_THREADS") {
            self.threads = parse_env("CRAFT_THREADS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        if self.threads == 0 {
            return Err(Error::Config("threads must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_backend_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.detection.canvas_size, 1280);
        assert_eq!(settings.detection.mag_ratio, 1.5);
        assert_eq!(settings.detection.text_threshold, 0.7);
        assert_eq!(settings.detection.link_threshold, 0.4);
        assert_eq!(settings.detection.low_text, 0.4);
        assert_eq!(settings.backend, Backend::Native);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let mut settings = Settings::default();
        settings
            .merge_toml(
                r#"
                [detection]
                canvas_size = 960
                low_text = 0.3

                [model]
                weights = "models/craft.onnx"
                backend = "onnx"
                "#,
            )
            .unwrap();
        assert_eq!(settings.detection.canvas_size, 960);
        assert_eq!(settings.detection.low_text, 0.3);
        assert_eq!(settings.detection.mag_ratio, 1.5);
        assert_eq!(settings.weights, Some(PathBuf::from("models/craft.onnx")));
        assert_eq!(settings.backend, Backend::Onnx);
        assert_eq!(settings.threads, 4);
    }

    #[test]
    fn unknown_keys_are_config_errors() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.merge_toml("[detection]\ncanvas = 3"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let env = HashMap::from([
            ("CRAFT_MAG_RATIO", "2.0"),
            ("CRAFT_TEXT_THRESHOLD", " 0.6 "),
            ("CRAFT_BACKEND", "native"),
            ("CRAFT_WEIGHTS", "/tmp/craft_mlt_25k.pth"),
        ]);
        let mut settings = Settings::default();
        settings.merge_toml("[detection]\nmag_ratio = 1.0").unwrap();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.detection.mag_ratio, 2.0);
        assert_eq!(settings.detection.text_threshold, 0.6);
        assert_eq!(
            settings.weights,
            Some(PathBuf::from("/tmp/craft_mlt_25k.pth"))
        );
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|key| (key == "CRAFT_CANVAS_SIZE").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("CRAFT_CANVAS_SIZE")));

        let err = settings
            .apply_env(|key| (key == "CRAFT_BACKEND").then(|| "tpu".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut settings = Settings::default();
        settings.detection.link_threshold = 1.5;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.detection.mag_ratio = -1.0;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.threads = 0;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_settings_reads_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[model]\nthreads = 2\n").unwrap();
        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.threads, 2);

        let missing = load_settings(Some(Path::new("no/such/settings.toml")));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
