use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, PaddingConfig2d,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings, Recorder, RecorderError},
    tensor::{activation::relu, backend::Backend, Tensor, TensorData},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use ndarray::{Array3, ArrayView4};
use tracing::instrument;

use crate::{Error, Result};

/// CPU backend the native detector runs on.
pub type NativeBackend = burn::backend::ndarray::NdArray<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub size: usize,
}

/// One stage of the network. A layer's index in [`BACKBONE`] or [`HEAD`] is
/// its index in the exported `nn.Sequential`, which is how weights are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Conv(ConvSpec),
    Relu,
    MaxPool(PoolSpec),
}

const fn conv(in_channels: usize, out_channels: usize, kernel: usize) -> Layer {
    Layer::Conv(ConvSpec {
        in_channels,
        out_channels,
        kernel,
        padding: kernel / 2,
    })
}

/// Every pooling stage halves the resolution.
pub const POOL_SPEC: PoolSpec = PoolSpec { size: 2 };
const POOL: Layer = Layer::MaxPool(POOL_SPEC);

pub const BACKBONE: [Layer; 15] = [
    conv(3, 64, 3),
    Layer::Relu,
    conv(64, 64, 3),
    Layer::Relu,
    POOL,
    conv(64, 128, 3),
    Layer::Relu,
    conv(128, 128, 3),
    Layer::Relu,
    POOL,
    conv(128, 256, 3),
    Layer::Relu,
    conv(256, 256, 3),
    Layer::Relu,
    POOL,
];

pub const HEAD: [Layer; 5] = [
    conv(256, 128, 3),
    Layer::Relu,
    conv(128, 64, 3),
    Layer::Relu,
    conv(64, 2, 1),
];

/// Input pixels per score map cell.
pub fn output_stride() -> usize {
    BACKBONE
        .iter()
        .chain(HEAD.iter())
        .map(|layer| match layer {
            Layer::MaxPool(pool) => pool.size,
            _ => 1,
        })
        .product()
}

pub struct NetOutput {
    /// `[2, h, w]`, channel 0 is text and channel 1 is link.
    pub scoremap: Array3<f32>,
    /// Backbone activations, when the backend exposes them.
    pub features: Option<Array3<f32>>,
}

/// Inference over a normalized `[1, 3, H, W]` batch. Implementations hold
/// only read-only state so a single instance can serve concurrent callers.
pub trait TextDetector: Send + Sync {
    fn forward(&self, input: ArrayView4<f32>) -> Result<NetOutput>;
}

fn conv_layers(layers: &[Layer]) -> impl Iterator<Item = (usize, &ConvSpec)> + '_ {
    layers
        .iter()
        .enumerate()
        .filter_map(|(index, layer)| match layer {
            Layer::Conv(spec) => Some((index, spec)),
            _ => None,
        })
}

/// Simplified CRAFT: a VGG-style backbone down to 1/8 resolution and a small
/// head producing the text and link maps.
#[derive(Module, Debug)]
pub struct CraftModel<B: Backend> {
    backbone_convs: Vec<Conv2d<B>>,
    head_convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> CraftModel<B> {
    pub fn new(device: &B::Device) -> Self {
        Self::with_initializer(
            device,
            Initializer::KaimingUniform {
                gain: 1.0 / 3.0f64.sqrt(),
                fan_out_only: false,
            },
        )
    }

    pub fn with_initializer(device: &B::Device, initializer: Initializer) -> Self {
        let build = |layers: &[Layer]| {
            conv_layers(layers)
                .map(|(_, spec)| {
                    Conv2dConfig::new(
                        [spec.in_channels, spec.out_channels],
                        [spec.kernel, spec.kernel],
                    )
                    .with_padding(PaddingConfig2d::Explicit(spec.padding, spec.padding))
                    .with_initializer(initializer.clone())
                    .init::<B>(device)
                })
                .collect::<Vec<_>>()
        };

        Self {
            backbone_convs: build(&BACKBONE),
            head_convs: build(&HEAD),
            pool: MaxPool2dConfig::new([POOL_SPEC.size, POOL_SPEC.size])
                .with_strides([POOL_SPEC.size, POOL_SPEC.size])
                .init(),
        }
    }

    /// Returns `(scores, features)`.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let features = self.stage(&BACKBONE, &self.backbone_convs, input);
        let scores = self.stage(&HEAD, &self.head_convs, features.clone());
        (scores, features)
    }

    fn stage(&self, layers: &[Layer], convs: &[Conv2d<B>], input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut convs = convs.iter();
        layers.iter().fold(input, |x, layer| match layer {
            Layer::Conv(_) => match convs.next() {
                Some(conv) => conv.forward(x),
                None => x,
            },
            Layer::Relu => relu(x),
            Layer::MaxPool(_) => self.pool.forward(x),
        })
    }
}

/// Regex remaps from the PyTorch `nn.Sequential` keys onto the conv lists of
/// [`CraftModel`]. Checkpoints saved from `DataParallel` carry a `module.`
/// prefix.
fn state_dict_remaps() -> Vec<(String, String)> {
    let mut remaps = vec![(r"^module\.(.+)$".to_string(), "$1".to_string())];
    for (stage, layers, field) in [
        ("backbone", &BACKBONE[..], "backbone_convs"),
        ("head", &HEAD[..], "head_convs"),
    ] {
        for (ordinal, (index, _)) in conv_layers(layers).enumerate() {
            remaps.push((
                format!(r"^{stage}\.{index}\.(.+)$"),
                format!("{field}.{ordinal}.$1"),
            ));
        }
    }
    remaps
}

/// Native CRAFT detector on burn's `NdArray` backend.
pub struct CraftNet {
    device: <NativeBackend as Backend>::Device,
    // burn modules are `Send` but not `Sync`; forward clones out of the lock.
    model: Mutex<CraftModel<NativeBackend>>,
}

impl CraftNet {
    pub fn new(model: CraftModel<NativeBackend>) -> Self {
        Self {
            device: Default::default(),
            model: Mutex::new(model),
        }
    }

    /// Loads a PyTorch state dict (`.pth`/`.pt`) or a burn record (`.mpk`).
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::ModelUnavailable(format!(
                "weights not found at {}",
                path.display()
            )));
        }
        let device = <NativeBackend as Backend>::Device::default();
        let model = CraftModel::<NativeBackend>::new(&device);
        let unavailable = |err: RecorderError| {
            Error::ModelUnavailable(format!("failed to load {}: {err}", path.display()))
        };

        let model = match path.extension().and_then(|ext| ext.to_str()) {
            Some("pth" | "pt") => {
                let args = state_dict_remaps()
                    .iter()
                    .fold(LoadArgs::new(path.to_path_buf()), |args, (from, to)| {
                        args.with_key_remap(from, to)
                    });
                let record: CraftModelRecord<NativeBackend> =
                    PyTorchFileRecorder::<FullPrecisionSettings>::default()
                        .load(args, &device)
                        .map_err(unavailable)?;
                model.load_record(record)
            }
            _ => model
                .load_file(
                    path,
                    &DefaultFileRecorder::<FullPrecisionSettings>::new(),
                    &device,
                )
                .map_err(unavailable)?,
        };
        log::debug!("Loaded CRAFT weights from {}", path.display());

        Ok(Self {
            device,
            model: Mutex::new(model),
        })
    }

    /// Writes the weights as a burn record, which loads faster than a
    /// PyTorch pickle.
    pub fn save(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.model()?
            .save_file(
                path.into(),
                &DefaultFileRecorder::<FullPrecisionSettings>::new(),
            )
            .map_err(|err| std::io::Error::other(err.to_string()).into())
    }

    fn model(&self) -> Result<CraftModel<NativeBackend>> {
        let model = self
            .model
            .lock()
            .map_err(|_| Error::Device("detector lock poisoned".into()))?;
        Ok(model.clone())
    }
}

fn to_array3(tensor: Tensor<NativeBackend, 4>) -> Result<Array3<f32>> {
    let [_, channels, height, width] = tensor.dims();
    let values = tensor
        .into_data()
        .into_vec::<f32>()
        .map_err(|err| Error::Device(format!("reading network output: {err:?}")))?;
    Array3::from_shape_vec((channels, height, width), values)
        .map_err(|err| Error::Device(err.to_string()))
}

impl TextDetector for CraftNet {
    #[instrument(level = "debug", skip(self, input), fields(shape = ?input.shape()))]
    fn forward(&self, input: ArrayView4<f32>) -> Result<NetOutput> {
        let (batch, channels, height, width) = input.dim();
        if batch != 1 || channels != 3 {
            return Err(Error::Device(format!(
                "expected a [1, 3, H, W] input, got {:?}",
                input.shape()
            )));
        }
        let stride = output_stride();
        if height < stride || width < stride {
            return Err(Error::Device(format!(
                "input of {width}x{height} is smaller than the network stride {stride}"
            )));
        }

        let data = TensorData::new(
            input.iter().copied().collect::<Vec<f32>>(),
            [batch, channels, height, width],
        );
        let (scores, features) = self
            .model()?
            .forward(Tensor::from_data(data, &self.device));

        Ok(NetOutput {
            scoremap: to_array3(scores)?,
            features: Some(to_array3(features)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn constant_net(value: f64) -> CraftNet {
        let device = Default::default();
        CraftNet::new(CraftModel::with_initializer(
            &device,
            Initializer::Constant { value },
        ))
    }

    #[test]
    fn architecture_matches_stages() {
        assert_eq!(output_stride(), 8);
        let specs = conv_layers(&BACKBONE)
            .chain(conv_layers(&HEAD))
            .map(|(_, spec)| *spec)
            .collect::<Vec<_>>();
        assert_eq!(specs.len(), 9);
        assert_eq!(specs[8].kernel, 1);
        assert_eq!(specs[8].padding, 0);
        assert_eq!(specs[8].out_channels, 2);
        for pair in specs.windows(2) {
            assert_eq!(pair[0].out_channels, pair[1].in_channels);
        }
    }

    #[test]
    fn sequential_keys_map_onto_conv_lists() {
        let remaps = state_dict_remaps();
        assert!(remaps.contains(&(r"^backbone\.12\.(.+)$".into(), "backbone_convs.5.$1".into())));
        assert!(remaps.contains(&(r"^head\.4\.(.+)$".into(), "head_convs.2.$1".into())));
        assert!(!remaps.iter().any(|(from, _)| from.contains(r"backbone\.1\.")));
        assert_eq!(remaps.len(), 10);
    }

    #[test]
    fn forward_produces_strided_maps() {
        let net = constant_net(0.001);
        let input = Array4::<f32>::ones((1, 3, 32, 48));
        let output = net.forward(input.view()).unwrap();
        assert_eq!(output.scoremap.shape(), &[2, 4, 6]);
        assert_eq!(output.features.unwrap().shape(), &[256, 4, 6]);
        assert!(output.scoremap.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn zero_weights_give_zero_scores() {
        let device = Default::default();
        let net = CraftNet::new(CraftModel::with_initializer(&device, Initializer::Zeros));
        let input = Array4::<f32>::from_elem((1, 3, 16, 16), 3.0);
        let output = net.forward(input.view()).unwrap();
        assert_eq!(output.scoremap.shape(), &[2, 2, 2]);
        assert!(output.scoremap.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn rejects_mismatched_input() {
        let net = constant_net(0.0);
        let four_channels = Array4::<f32>::zeros((1, 4, 32, 32));
        assert!(matches!(
            net.forward(four_channels.view()),
            Err(Error::Device(_))
        ));
        let tiny = Array4::<f32>::zeros((1, 3, 4, 32));
        assert!(matches!(net.forward(tiny.view()), Err(Error::Device(_))));
    }

    #[test]
    fn saved_record_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("craft.mpk");
        let net = constant_net(0.002);
        net.save(&path).unwrap();

        let loaded = CraftNet::load(&path).unwrap();
        let input = Array4::<f32>::ones((1, 3, 16, 24));
        let expected = net.forward(input.view()).unwrap().scoremap;
        let actual = loaded.forward(input.view()).unwrap().scoremap;
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn corrupt_record_makes_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("craft.mpk");
        std::fs::write(&path, b"not a burn record").unwrap();
        let err = CraftNet::load(&path).err().unwrap();
        assert!(err.is_model_unavailable());
    }

    #[test]
    fn missing_file_makes_model_unavailable() {
        let err = CraftNet::load("does/not/exist.pth").err().unwrap();
        assert!(err.is_model_unavailable());
    }
}
