use image::flat::SampleLayout;
use nalgebra::Vector3;
use ndarray::{Array3, ShapeBuilder};

/// Color image with shape `(height, width, 3)`, registered to the depth frames.
pub type ColorImage = Array3<u8>;

/// Conversion into an ndarray of shape `(height, width, channels)`.
pub trait IntoArray3 {
    fn into_array3(self) -> Array3<u8>;
}

impl IntoArray3 for image::RgbImage {
    fn into_array3(self) -> Array3<u8> {
        let SampleLayout {
            channels,
            channel_stride,
            height,
            height_stride,
            width,
            width_stride,
        } = self.sample_layout();
        let shape = (height as usize, width as usize, channels as usize);
        let strides = (height_stride, width_stride, channel_stride);
        // The layout comes from the buffer itself, so the shape always matches.
        Array3::from_shape_vec(shape.strides(strides), self.into_raw())
            .unwrap_or_else(|_| Array3::zeros((0, 0, 3)))
    }
}

/// Reads the color at pixel `(u, v)`.
pub fn color_at(image: &ColorImage, u: usize, v: usize) -> Option<Vector3<f32>> {
    let (height, width, channels) = image.dim();
    if u < width && v < height && channels >= 3 {
        Some(Vector3::new(
            image[(v, u, 0)] as f32,
            image[(v, u, 1)] as f32,
            image[(v, u, 2)] as f32,
        ))
    } else {
        None
    }
}
