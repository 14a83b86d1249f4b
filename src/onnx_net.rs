use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayViewD, Axis, Ix3};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{
    craft_net::{NetOutput, TextDetector},
    Error, ExecutionProvider, Result,
};

/// CRAFT exported to ONNX, run through ONNX Runtime.
pub struct OnnxCraftNet {
    session: Session,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf, canvas_size: u32) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    TensorRTExecutionProvider::default()
        .with_profile_min_shapes("input:1x3x32x32")
        .with_profile_max_shapes(format!("input:1x3x{canvas_size}x{canvas_size}"))
        .with_profile_opt_shapes(format!("input:1x3x{canvas_size}x{canvas_size}"))
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .with_builder_optimization_level(5)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

fn unavailable(path: &Path) -> impl Fn(ort::Error) -> Error + '_ {
    move |err| Error::ModelUnavailable(format!("{}: {err}", path.display()))
}

fn device(err: ort::Error) -> Error {
    Error::Device(err.to_string())
}

impl OnnxCraftNet {
    #[cfg_attr(not(feature = "tensorrt"), allow(unused_variables))]
    #[instrument(level = "debug")]
    pub fn init(
        path: PathBuf,
        num_threads: usize,
        canvas_size: u32,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> Result<Self> {
        #[cfg(feature = "directml")]
        let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "tensorrt")]
                    ExecutionProvider::TensorRT => Some(setup_tensorrt(
                        cache_path.clone().unwrap_or_else(|| {
                            path.parent().unwrap_or(Path::new(".")).join(".cache")
                        }),
                        canvas_size,
                    )),
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => Some(setup_coreml()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );

        let to_unavailable = unavailable(&path);
        let session = Session::builder()
            .map_err(&to_unavailable)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(&to_unavailable)?
            .with_memory_pattern(parallel)
            .map_err(&to_unavailable)?
            .with_parallel_execution(parallel)
            .map_err(&to_unavailable)?
            .with_inter_threads(num_threads)
            .map_err(&to_unavailable)?
            .with_intra_threads(num_threads)
            .map_err(&to_unavailable)?
            .with_execution_providers(execution_providers)
            .map_err(&to_unavailable)?
            .commit_from_file(&path)
            .map_err(&to_unavailable)?;

        log::debug!("CRAFT session inputs: {:?}", session.inputs);
        log::debug!("CRAFT session outputs: {:?}", session.outputs);
        if session.inputs.is_empty() || session.outputs.is_empty() {
            return Err(Error::ModelUnavailable(format!(
                "{} has no inputs or outputs",
                path.display()
            )));
        }

        Ok(Self { session })
    }
}

/// Accepts `[1, 2, h, w]` from the simplified model and `[1, h, w, 2]` from
/// upstream CRAFT exports, and returns `[2, h, w]`.
fn to_channel_first(scores: ArrayViewD<f32>) -> Result<Array3<f32>> {
    let shape = scores.shape().to_vec();
    let single = scores
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix3>()
        .map_err(|err| Error::Device(format!("score output {shape:?}: {err}")))?;
    match shape.as_slice() {
        [1, 2, _, _] => Ok(single.to_owned()),
        [1, _, _, 2] => Ok(single
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .into_owned()),
        _ => Err(Error::Device(format!("unexpected score output shape {shape:?}"))),
    }
}

impl TextDetector for OnnxCraftNet {
    #[instrument(level = "debug", skip(self, input), fields(shape = ?input.shape()))]
    fn forward(&self, input: ndarray::ArrayView4<f32>) -> Result<NetOutput> {
        let input_name = self.session.inputs[0].name.as_str();
        let inputs = inputs![input_name => input.to_owned()].map_err(device)?;
        let outputs = self.session.run(inputs).map_err(device)?;

        let score_name = self.session.outputs[0].name.as_str();
        let scores = outputs
            .get(score_name)
            .ok_or_else(|| Error::Device(format!("missing output {score_name}")))?
            .try_extract_tensor::<f32>()
            .map_err(device)?;
        let scoremap = to_channel_first(scores)?;

        let features = match self.session.outputs.get(1) {
            Some(output) => match outputs.get(output.name.as_str()) {
                Some(value) => Some(
                    value
                        .try_extract_tensor::<f32>()
                        .map_err(device)?
                        .index_axis(Axis(0), 0)
                        .into_dimensionality::<Ix3>()
                        .map_err(|err| Error::Device(err.to_string()))?
                        .to_owned(),
                ),
                None => None,
            },
            None => None,
        };

        Ok(NetOutput { scoremap, features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn accepts_channel_first_scores() {
        let scores =
            Array4::from_shape_fn((1, 2, 3, 4), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
        let out = to_channel_first(scores.view().into_dyn()).unwrap();
        assert_eq!(out.shape(), &[2, 3, 4]);
        assert_eq!(out[[1, 2, 3]], 123.0);
    }

    #[test]
    fn accepts_channel_last_scores() {
        let scores =
            Array4::from_shape_fn((1, 3, 4, 2), |(_, y, x, c)| (c * 100 + y * 10 + x) as f32);
        let out = to_channel_first(scores.view().into_dyn()).unwrap();
        assert_eq!(out.shape(), &[2, 3, 4]);
        assert_eq!(out[[0, 1, 2]], 12.0);
        assert_eq!(out[[1, 2, 3]], 123.0);
    }

    #[test]
    fn rejects_other_layouts() {
        let scores = Array4::<f32>::zeros((1, 3, 4, 5));
        assert!(matches!(
            to_channel_first(scores.view().into_dyn()),
            Err(Error::Device(_))
        ));
    }
}
