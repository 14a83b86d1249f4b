use std::{path::PathBuf, str::FromStr};

use image::DynamicImage;
use ndarray::Array4;
use serde::Deserialize;
use tracing::instrument;

pub mod craft_net;
pub mod craft_utils;
mod error;
pub mod onnx_net;
mod result;
pub mod settings;
pub mod util;

pub use craft_net::{CraftModel, CraftNet, NativeBackend, NetOutput, TextDetector};
pub use craft_utils::{adjust_result_coordinates, get_det_boxes, mock_det_boxes, ScoreMaps};
pub use error::{Error, Result};
pub use onnx_net::OnnxCraftNet;
pub use result::*;
pub use util::ResizeParameters;

pub use ort as runtime;

/// Which runtime evaluates the detector weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// PyTorch state dict or burn record, evaluated with burn on the CPU.
    Native,
    /// ONNX export, evaluated with ONNX Runtime.
    Onnx,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Backend::Native),
            "onnx" => Ok(Backend::Onnx),
            other => Err(Error::Config(format!("unknown backend {other:?}"))),
        }
    }
}

pub struct CraftBuilder {
    threads: usize,
    weights: Option<PathBuf>,
    backend: Backend,
    detector: Option<Box<dyn TextDetector>>,
    options: DetectionOptions,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
}

impl CraftBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &settings::Settings) -> Self {
        let builder = Self::new()
            .threads(settings.threads)
            .backend(settings.backend)
            .options(settings.detection);
        match &settings.weights {
            Some(path) => builder.weights(path),
            None => builder,
        }
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(path.into());
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Uses an already constructed detector instead of loading weights.
    pub fn detector(mut self, detector: impl TextDetector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    pub fn options(mut self, options: DetectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    #[instrument(skip(self), level = "debug")]
    fn init_model(&mut self) -> Result<Box<dyn TextDetector>> {
        if let Some(detector) = self.detector.take() {
            return Ok(detector);
        }
        let path = self
            .weights
            .take()
            .ok_or_else(|| Error::ModelUnavailable("no weights configured".into()))?;
        if !path.exists() {
            return Err(Error::ModelUnavailable(format!(
                "weights not found at {}",
                path.display()
            )));
        }
        let model: Box<dyn TextDetector> = match self.backend {
            Backend::Native => Box::new(CraftNet::load(&path)?),
            Backend::Onnx => Box::new(OnnxCraftNet::init(
                path,
                self.threads,
                self.options.canvas_size,
                &self.execution_providers,
                self.cache_path.clone(),
            )?),
        };
        Ok(model)
    }

    /// Fails with [`Error::ModelUnavailable`] if the detector can't be loaded.
    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<Craft> {
        self.options.validate()?;
        let model = self.init_model()?;
        log::debug!("CRAFT detector loaded ({:?} backend)", self.backend);
        Ok(Craft {
            model: Some(model),
            options: self.options,
        })
    }

    /// Like [`build`](Self::build), but keeps going without a detector when
    /// loading fails. [`Craft::detect`] then reports
    /// [`Error::ModelUnavailable`] so callers can serve a fallback.
    #[instrument(skip(self))]
    pub fn build_degraded(mut self) -> Result<Craft> {
        self.options.validate()?;
        let model = match self.init_model() {
            Ok(model) => Some(model),
            Err(err) => {
                log::warn!("Running without a text detector: {err}");
                None
            }
        };
        Ok(Craft {
            model,
            options: self.options,
        })
    }
}

impl Default for CraftBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            weights: None,
            backend: Backend::Native,
            detector: None,
            options: DetectionOptions::default(),
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

/// Text detector plus the options it was built with. Immutable after
/// construction; share it behind an `Arc` to serve concurrent requests.
pub struct Craft {
    model: Option<Box<dyn TextDetector>>,
    options: DetectionOptions,
}

impl Craft {
    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn options(&self) -> DetectionOptions {
        self.options
    }

    /// Per-call options override the ones the engine was built with.
    fn resolve_options(&self, options: Option<DetectionOptions>) -> Result<DetectionOptions> {
        match options {
            Some(options) => {
                options.validate()?;
                Ok(options)
            }
            None => Ok(self.options),
        }
    }

    /// Runs the network and returns its score maps along with the resize that
    /// produced the network input.
    #[instrument(skip(self, image))]
    pub fn score_maps(
        &self,
        image: &DynamicImage,
        options: Option<DetectionOptions>,
    ) -> Result<(ScoreMaps, ResizeParameters)> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::InvalidImage {
                width: image.width(),
                height: image.height(),
            });
        }
        let options = self.resolve_options(options)?;
        let model = self
            .model
            .as_deref()
            .ok_or_else(|| Error::ModelUnavailable("detector was not loaded".into()))?;

        let (input, params) = preprocess(image, &options)?;
        let output = model.forward(input.view())?;
        let maps = ScoreMaps::from_net_output(&output, &params)?;

        #[cfg(feature = "debug")]
        {
            std::fs::create_dir_all("debug")?;
            util::to_luma_image(maps.text().view()).save("debug/score_text.png")?;
            util::to_luma_image(maps.link().view()).save("debug/score_link.png")?;
        }

        Ok((maps, params))
    }

    #[instrument(skip(self, image))]
    pub fn detect(
        &self,
        image: &DynamicImage,
        options: Option<DetectionOptions>,
    ) -> Result<DetectionResult> {
        let (maps, params) = self.score_maps(image, options)?;
        postprocess(&maps, &params, &self.resolve_options(options)?)
    }
}

/// Resizes, pads and normalizes `image` into a `[1, 3, H, W]` network input.
#[instrument(level = "debug", skip(image))]
pub fn preprocess(
    image: &DynamicImage,
    options: &DetectionOptions,
) -> Result<(Array4<f32>, ResizeParameters)> {
    let (canvas, params) =
        util::resize_aspect_ratio(&image.to_rgb8(), options.canvas_size, options.mag_ratio)?;
    let input = util::normalize_mean_variance(&canvas, &util::MEAN_VALUES, &util::VARIANCE_VALUES);
    Ok((input, params))
}

/// Extracts boxes from `maps` and maps them into source image coordinates.
#[instrument(level = "debug", skip(maps))]
pub fn postprocess(
    maps: &ScoreMaps,
    params: &ResizeParameters,
    options: &DetectionOptions,
) -> Result<DetectionResult> {
    let (boxes, polys) = get_det_boxes(
        maps,
        options.text_threshold,
        options.link_threshold,
        options.low_text,
    );
    Ok(DetectionResult {
        boxes: adjust_result_coordinates(&boxes, params.ratio, params.ratio)?,
        polys: adjust_result_coordinates(&polys, params.ratio, params.ratio)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionOptions {
    /// Upper bound on the long side of the network input.
    pub canvas_size: u32,
    pub mag_ratio: f32,
    pub text_threshold: f32,
    pub link_threshold: f32,
    pub low_text: f32,
}

impl DetectionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.canvas_size == 0 {
            return Err(Error::Config("canvas_size must be positive".into()));
        }
        if !self.mag_ratio.is_finite() || self.mag_ratio <= 0.0 {
            return Err(Error::Config(format!(
                "mag_ratio must be positive, got {}",
                self.mag_ratio
            )));
        }
        for (name, value) in [
            ("text_threshold", self.text_threshold),
            ("link_threshold", self.link_threshold),
            ("low_text", self.low_text),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            canvas_size: 1280,
            mag_ratio: 1.5,
            text_threshold: 0.7,
            link_threshold: 0.4,
            low_text: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("ONNX".parse::<Backend>().unwrap(), Backend::Onnx);
        assert_eq!("native".parse::<Backend>().unwrap(), Backend::Native);
        assert!(matches!("gpu".parse::<Backend>(), Err(Error::Config(_))));
    }

    #[test]
    fn builder_without_weights_is_unavailable() {
        let err = CraftBuilder::new().build().err().unwrap();
        assert!(err.is_model_unavailable());

        let err = CraftBuilder::new()
            .weights("no/such/craft.pth")
            .build()
            .err()
            .unwrap();
        assert!(err.is_model_unavailable());
    }

    #[test]
    fn builder_rejects_invalid_options() {
        let options = DetectionOptions {
            low_text: 2.0,
            ..Default::default()
        };
        let err = CraftBuilder::new().options(options).build_degraded().err();
        assert!(matches!(err, Some(Error::Config(_))));
    }

    #[test]
    fn engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Craft>();
    }
}
