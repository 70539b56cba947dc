use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use image::{DynamicImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

/// Converts a decoded image into the pixel tensor a model expects.
///
/// Calibration and inference must use the same implementation.
pub trait Preprocessor {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor>;
}

impl<P: Preprocessor + ?Sized> Preprocessor for &P {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        (**self).preprocess(image)
    }
}

/// Resampling filters understood by the processor configs (PIL codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resample {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Resample {
    pub fn from_pil_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Nearest),
            1 => Some(Self::Lanczos),
            2 => Some(Self::Bilinear),
            3 => Some(Self::Bicubic),
            _ => None,
        }
    }

    fn filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Bilinear => FilterType::Triangle,
            Self::Bicubic => FilterType::CatmullRom,
            Self::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Resize/rescale/normalize parameters of the TrOCR image processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub height: u32,
    pub width: u32,
    pub resample: Resample,
    pub rescale_factor: f32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            height: 384,
            width: 384,
            resample: Resample::Bilinear,
            rescale_factor: 1.0 / 255.0,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProcessorSize {
    Square(u32),
    Explicit { height: u32, width: u32 },
    Shortest { shortest_edge: u32 },
}

#[derive(Debug, Deserialize)]
struct ProcessorConfigFile {
    size: Option<ProcessorSize>,
    resample: Option<u32>,
    do_rescale: Option<bool>,
    rescale_factor: Option<f32>,
    do_normalize: Option<bool>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
}

impl PreprocessConfig {
    /// Load a Hugging Face `preprocessor_config.json`, falling back to the
    /// TrOCR defaults for absent keys.
    pub fn from_processor_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| {
            format!("failed to read preprocessor config from {}", path.display())
        })?;
        Self::from_processor_json(&bytes)
            .with_context(|| format!("failed to parse preprocessor config at {}", path.display()))
    }

    pub fn from_processor_json(bytes: &[u8]) -> Result<Self> {
        let file: ProcessorConfigFile = serde_json::from_slice(bytes)?;
        let mut cfg = Self::default();
        match file.size {
            Some(ProcessorSize::Square(edge)) | Some(ProcessorSize::Shortest { shortest_edge: edge }) => {
                cfg.height = edge;
                cfg.width = edge;
            }
            Some(ProcessorSize::Explicit { height, width }) => {
                cfg.height = height;
                cfg.width = width;
            }
            None => {}
        }
        if let Some(code) = file.resample {
            cfg.resample = Resample::from_pil_code(code)
                .with_context(|| format!("unsupported resample code {code}"))?;
        }
        if file.do_rescale == Some(false) {
            cfg.rescale_factor = 1.0;
        } else if let Some(factor) = file.rescale_factor {
            cfg.rescale_factor = factor;
        }
        if file.do_normalize == Some(false) {
            cfg.image_mean = [0.0; 3];
            cfg.image_std = [1.0; 3];
        } else {
            if let Some(mean) = file.image_mean {
                cfg.image_mean = mean;
            }
            if let Some(std) = file.image_std {
                cfg.image_std = std;
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.height > 0 && self.width > 0,
            "preprocess size must be non-zero, got {}x{}",
            self.width,
            self.height
        );
        ensure!(
            self.image_std.iter().all(|std| *std != 0.0),
            "image_std must not contain zeros: {:?}",
            self.image_std
        );
        Ok(())
    }
}

/// TrOCR/ViT image processor: RGB, fixed resize, rescale, per-channel
/// normalization, NCHW `F32` output with a batch dimension of one.
#[derive(Debug, Clone)]
pub struct TrOcrPreprocessor {
    config: PreprocessConfig,
    device: Device,
}

impl TrOcrPreprocessor {
    pub fn new(config: PreprocessConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }
}

impl Preprocessor for TrOcrPreprocessor {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let PreprocessConfig {
            height,
            width,
            resample,
            rescale_factor,
            image_mean,
            image_std,
        } = self.config;
        let rgb = image.to_rgb8();
        let resized = if rgb.dimensions() == (width, height) {
            rgb
        } else {
            image::imageops::resize(&rgb, width, height, resample.filter())
        };

        let plane = (height as usize) * (width as usize);
        let mut data = vec![0f32; 3 * plane];
        for (idx, pixel) in resized.pixels().enumerate() {
            for channel in 0..3 {
                let value = pixel.0[channel] as f32 * rescale_factor;
                data[channel * plane + idx] = (value - image_mean[channel]) / image_std[channel];
            }
        }
        Ok(Tensor::from_vec(
            data,
            (1, 3, height as usize, width as usize),
            &self.device,
        )?)
    }
}
