use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::{
    preprocess::Preprocessor,
    session::{InputBindings, ModelSession, input_name},
};

/// One calibration sample: the model's input name bound to a pixel tensor.
#[derive(Debug, Clone)]
pub struct CalibrationBatch {
    pub input_name: String,
    pub pixel_values: Tensor,
    pub source: PathBuf,
}

impl CalibrationBatch {
    /// Single-entry bindings ready to hand to [`ModelSession::run`].
    pub fn into_bindings(self) -> InputBindings {
        let mut bindings = InputBindings::with_capacity(1);
        bindings.insert(self.input_name, self.pixel_values);
        bindings
    }
}

/// Pull-based supply of calibration batches.
///
/// `Ok(None)` marks exhaustion and is the normal end of a calibration pass.
pub trait CalibrationSource {
    fn next_batch(&mut self) -> Result<Option<CalibrationBatch>>;

    /// Number of batches still to come, when known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Walks a directory of calibration images in sorted file-name order and
/// yields one preprocessed batch per image.
///
/// The cursor only moves forward; build a new feeder to start over.
pub struct CalibrationFeeder<P> {
    input_name: String,
    image_dir: PathBuf,
    images: Vec<PathBuf>,
    cursor: usize,
    preprocessor: P,
}

impl<P: Preprocessor> CalibrationFeeder<P> {
    /// `session` is consulted only for the name of its first input.
    pub fn new(
        session: &impl ModelSession,
        image_dir: impl AsRef<Path>,
        preprocessor: P,
    ) -> Result<Self> {
        let input_name =
            input_name(session, 0).context("calibration model must declare an input")?;
        let image_dir = image_dir.as_ref().to_path_buf();
        let images = list_sorted(&image_dir)?;
        info!(
            dir = %image_dir.display(),
            images = images.len(),
            input = %input_name,
            "calibration feeder ready"
        );
        Ok(Self {
            input_name,
            image_dir,
            images,
            cursor: 0,
            preprocessor,
        })
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Image paths in the order they will be yielded.
    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    pub fn remaining(&self) -> usize {
        self.images.len().saturating_sub(self.cursor)
    }
}

impl<P: Preprocessor> CalibrationSource for CalibrationFeeder<P> {
    fn next_batch(&mut self) -> Result<Option<CalibrationBatch>> {
        let Some(path) = self.images.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        let image = image::open(&path)
            .with_context(|| format!("failed to open calibration image {}", path.display()))?;
        let pixel_values = self
            .preprocessor
            .preprocess(&image)
            .with_context(|| format!("failed to preprocess calibration image {}", path.display()))?;
        debug!(
            image = %path.display(),
            index = self.cursor,
            total = self.images.len(),
            "calibration batch"
        );
        Ok(Some(CalibrationBatch {
            input_name: self.input_name.clone(),
            pixel_values,
            source: path,
        }))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.remaining())
    }
}

fn list_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list calibration directory {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?;
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names.into_iter().map(|name| dir.join(name)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{TensorDim, TensorInfo};
    use anyhow::bail;
    use candle_core::Device;
    use image::{DynamicImage, Rgb, RgbImage};

    struct InputsOnly(Vec<TensorInfo>);

    impl ModelSession for InputsOnly {
        fn inputs(&self) -> &[TensorInfo] {
            &self.0
        }

        fn outputs(&self) -> &[TensorInfo] {
            &[]
        }

        fn run(&self, _: Option<&[&str]>, _: InputBindings) -> Result<Vec<Tensor>> {
            bail!("feeder must not run the model")
        }
    }

    /// Encodes the red channel of the top-left pixel so batches can be told apart.
    struct RedChannel;

    impl Preprocessor for RedChannel {
        fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
            let red = image.to_rgb8().get_pixel(0, 0).0[0] as f32;
            Ok(Tensor::new(&[[red]], &Device::Cpu)?)
        }
    }

    fn encoder() -> InputsOnly {
        InputsOnly(vec![TensorInfo::new(
            "pixel_values",
            vec![TensorDim::Fixed(1)],
            "float32",
        )])
    }

    fn write_png(dir: &Path, name: &str, red: u8) {
        RgbImage::from_pixel(2, 2, Rgb([red, 0, 0]))
            .save(dir.join(name))
            .expect("write png");
    }

    fn first_pixel(batch: &CalibrationBatch) -> f32 {
        batch.pixel_values.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn yields_sorted_batches_then_end_of_sequence() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        write_png(tmp.path(), "b.png", 20);
        write_png(tmp.path(), "a.png", 10);
        write_png(tmp.path(), "c.png", 30);

        let mut feeder = CalibrationFeeder::new(&encoder(), tmp.path(), RedChannel)?;
        assert_eq!(feeder.len_hint(), Some(3));

        let mut seen = Vec::new();
        while let Some(batch) = feeder.next_batch()? {
            assert_eq!(batch.input_name, "pixel_values");
            seen.push((
                batch.source.file_name().unwrap().to_string_lossy().into_owned(),
                first_pixel(&batch),
            ));
        }
        assert_eq!(
            seen,
            vec![
                ("a.png".to_string(), 10.0),
                ("b.png".to_string(), 20.0),
                ("c.png".to_string(), 30.0)
            ]
        );
        assert!(feeder.next_batch()?.is_none());
        assert_eq!(feeder.remaining(), 0);
        Ok(())
    }

    #[test]
    fn len_hint_counts_only_batches_still_to_come() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        write_png(tmp.path(), "a.png", 10);
        write_png(tmp.path(), "b.png", 20);

        let mut feeder = CalibrationFeeder::new(&encoder(), tmp.path(), RedChannel)?;
        assert_eq!(feeder.len_hint(), Some(2));
        assert!(feeder.next_batch()?.is_some());
        assert_eq!(feeder.len_hint(), Some(1));
        assert!(feeder.next_batch()?.is_some());
        assert!(feeder.next_batch()?.is_none());
        assert_eq!(feeder.len_hint(), Some(0));
        Ok(())
    }

    #[test]
    fn empty_directory_is_exhausted_immediately() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut feeder = CalibrationFeeder::new(&encoder(), tmp.path(), RedChannel)?;
        assert!(feeder.next_batch()?.is_none());
        Ok(())
    }

    #[test]
    fn undecodable_file_is_a_hard_failure() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        write_png(tmp.path(), "a.png", 1);
        fs::write(tmp.path().join("b.png"), b"not an image")?;

        let mut feeder = CalibrationFeeder::new(&encoder(), tmp.path(), RedChannel)?;
        assert!(feeder.next_batch()?.is_some());
        let err = feeder.next_batch().unwrap_err();
        assert!(format!("{err:#}").contains("b.png"), "{err:#}");
        Ok(())
    }

    #[test]
    fn model_without_inputs_is_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(CalibrationFeeder::new(&InputsOnly(Vec::new()), tmp.path(), RedChannel).is_err());
        Ok(())
    }

    #[test]
    fn missing_directory_is_rejected() {
        let result = CalibrationFeeder::new(&encoder(), "/nonexistent/calibration", RedChannel);
        assert!(result.is_err());
    }

    #[test]
    fn batch_converts_to_single_binding() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        write_png(tmp.path(), "only.png", 5);
        let mut feeder = CalibrationFeeder::new(&encoder(), tmp.path(), RedChannel)?;
        let bindings = feeder.next_batch()?.expect("one batch").into_bindings();
        assert_eq!(bindings.len(), 1);
        assert!(bindings.contains_key("pixel_values"));
        Ok(())
    }
}
