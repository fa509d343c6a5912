use std::io::BufRead;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::camera::CameraIntrinsics;
use crate::error::{Error, Result};
use crate::image::{ColorImage, DepthFrame, IntoArray3};

/// Meters per raw unit of TUM style 16-bit depth images.
pub const TUM_DEPTH_SCALE: f32 = 1.0 / 5000.0;

/// One frame of a [`DepthDataset`].
pub struct DatasetFrame {
    pub timestamp: f64,
    pub depth: DepthFrame,
    pub color: Option<ColorImage>,
}

/// Sequence of 16-bit depth images, and optionally registered color images,
/// listed in TUM style `depth.txt` and `rgb.txt` files.
pub struct DepthDataset {
    base_dir: PathBuf,
    depth_images: Vec<(f64, String)>,
    rgb_images: Option<Vec<String>>,
    pub intrinsics: CameraIntrinsics,
    pub depth_scale: f32,
}

fn read_file_list(filepath: &Path) -> Result<Vec<(f64, String)>> {
    let file = std::fs::File::open(filepath)?;
    let reader = std::io::BufReader::new(file);
    let mut file_list = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line
            .split(&[',', '\t', ' '])
            .filter(|token| !token.is_empty())
            .collect();
        if tokens.len() < 2 {
            return Err(Error::Parser(format!(
                "{}: expected `timestamp filename`, got `{line}`",
                filepath.display()
            )));
        }
        let timestamp = tokens[0].parse::<f64>().map_err(|err| {
            Error::Parser(format!("{}: bad timestamp {}: {err}", filepath.display(), tokens[0]))
        })?;
        file_list.push((timestamp, tokens[1].to_string()));
    }

    Ok(file_list)
}

/// Pairs entries of two time sorted lists whose timestamps are within 20 ms.
fn associate<T1: Clone, T2: Clone>(
    first_list: &[(f64, T1)],
    second_list: &[(f64, T2)],
) -> Vec<(f64, T1, f64, T2)> {
    let mut first_list = first_list.iter().peekable();
    let mut second_list = second_list.iter().peekable();
    let mut result = Vec::<(f64, T1, f64, T2)>::new();
    while let (Some((first_time, first_value)), Some((second_time, second_value))) =
        (first_list.peek(), second_list.peek())
    {
        if (first_time - second_time).abs() < 0.02 {
            result.push((
                *first_time,
                first_value.clone(),
                *second_time,
                second_value.clone(),
            ));
            first_list.next();
            second_list.next();
        } else if first_time < second_time {
            first_list.next();
        } else {
            second_list.next();
        }
    }

    result
}

impl DepthDataset {
    /// Loads the frame lists of a dataset directory. `depth.txt` is required;
    /// when `rgb.txt` exists, only depth frames with a matching color frame
    /// are kept.
    pub fn load<P: AsRef<Path>>(base_dir: P, intrinsics: CameraIntrinsics) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let depth_files = read_file_list(&base_dir.join("depth.txt"))?;

        let rgb_path = base_dir.join("rgb.txt");
        let (depth_images, rgb_images) = if rgb_path.exists() {
            let rgb_files = read_file_list(&rgb_path)?;
            let pairs = associate(&depth_files, &rgb_files);
            (
                pairs
                    .iter()
                    .map(|(time, depth, _, _)| (*time, depth.clone()))
                    .collect(),
                Some(pairs.into_iter().map(|(_, _, _, rgb)| rgb).collect()),
            )
        } else {
            (depth_files, None)
        };

        Ok(Self {
            base_dir,
            depth_images,
            rgb_images,
            intrinsics,
            depth_scale: TUM_DEPTH_SCALE,
        })
    }

    pub fn with_depth_scale(mut self, depth_scale: f32) -> Self {
        self.depth_scale = depth_scale;
        self
    }

    pub fn len(&self) -> usize {
        self.depth_images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth_images.is_empty()
    }

    pub fn has_color(&self) -> bool {
        self.rgb_images.is_some()
    }

    /// Reads the frame at `index`.
    pub fn get(&self, index: usize) -> Result<DatasetFrame> {
        let (timestamp, depth_file) = self.depth_images.get(index).ok_or_else(|| {
            Error::invalid_parameter(format!("frame {index} out of {}", self.len()))
        })?;

        let depth_image = image::open(self.base_dir.join(depth_file))?.into_luma16();
        let (width, height) = depth_image.dimensions();
        let raw = Array2::from_shape_vec((height as usize, width as usize), depth_image.into_raw())
            .map_err(|err| Error::format(err.to_string()))?;
        let depth = DepthFrame::from_u16(&raw.view(), self.depth_scale, self.intrinsics.clone());

        let color = match &self.rgb_images {
            Some(rgb_images) => Some(
                image::open(self.base_dir.join(&rgb_images[index]))?
                    .into_rgb8()
                    .into_array3(),
            ),
            None => None,
        };

        Ok(DatasetFrame {
            timestamp: *timestamp,
            depth,
            color,
        })
    }
}
