use ndarray::prelude::*;

/// Generic representation of attributes found in 3D model/object/geometry files.
#[derive(Clone, Debug)]
pub struct Geometry {
    /// The 3D points. Shape is (Nx3).
    pub points: Array2<f32>,
    /// The RGB colors. Shape is (Nx3).
    pub colors: Option<Array2<u8>>,
    /// Per vertices normals. Shape is (Nx3)
    pub normals: Option<Array2<f32>>,
    /// Triangle vertex indices. Shape is (Mx3).
    pub faces: Option<Array2<usize>>,
}
