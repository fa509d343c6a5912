use std::collections::HashMap;

use nalgebra::Vector3;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::io::Geometry;
use crate::volume::VoxelGrid;

/// Indexed triangle mesh. Vertices and normals are `(N, 3)`, faces `(M, 3)`.
#[derive(Clone, Debug)]
pub struct TriangleMesh {
    pub vertices: Array2<f32>,
    pub faces: Array2<usize>,
    pub normals: Option<Array2<f32>>,
    pub colors: Option<Array2<u8>>,
}

impl TriangleMesh {
    pub fn empty() -> Self {
        Self {
            vertices: Array2::zeros((0, 3)),
            faces: Array2::zeros((0, 3)),
            normals: None,
            colors: None,
        }
    }

    pub fn len_vertices(&self) -> usize {
        self.vertices.nrows()
    }

    pub fn len_faces(&self) -> usize {
        self.faces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Fills `normals` with the average of the incident face normals.
    pub fn compute_normals(&mut self) {
        self.normals = Some(compute_normals(&self.vertices.view(), &self.faces.view()));
    }
}

/// Area-independent vertex normals, the mean of the unit normals of the
/// faces sharing each vertex.
pub fn compute_normals(vertices: &ArrayView2<f32>, faces: &ArrayView2<usize>) -> Array2<f32> {
    let vertex = |i: usize| Vector3::new(vertices[(i, 0)], vertices[(i, 1)], vertices[(i, 2)]);

    let mut normal_sum = vec![Vector3::<f32>::zeros(); vertices.nrows()];
    for face in faces.axis_iter(Axis(0)) {
        let p0 = vertex(face[0]);
        let mut normal = (vertex(face[1]) - p0).cross(&(vertex(face[2]) - p0));
        let mag = normal.magnitude();
        if mag > 0.0 {
            normal /= mag;
        }
        for f in [face[0], face[1], face[2]] {
            normal_sum[f] += normal;
        }
    }

    let mut normals = Array2::zeros((vertices.nrows(), 3));
    for (mut row, sum) in normals.axis_iter_mut(Axis(0)).zip(normal_sum) {
        let normal = sum.try_normalize(1e-12).unwrap_or_else(Vector3::zeros);
        row[0] = normal[0];
        row[1] = normal[1];
        row[2] = normal[2];
    }
    normals
}

impl From<TriangleMesh> for Geometry {
    fn from(mesh: TriangleMesh) -> Geometry {
        Geometry {
            points: mesh.vertices,
            colors: mesh.colors,
            normals: mesh.normals,
            faces: Some(mesh.faces),
        }
    }
}

/// Cube corner offsets, bottom face counter clockwise then top face.
const CUBE_CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Six tetrahedra sharing the cube diagonal 0-6.
const CUBE_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 5, 1, 6],
    [0, 1, 2, 6],
    [0, 2, 3, 6],
    [0, 3, 7, 6],
    [0, 7, 4, 6],
    [0, 4, 5, 6],
];

/// A cube corner sample: linear cell index, position and distance.
#[derive(Clone, Copy)]
struct Corner {
    key: usize,
    position: Vector3<f32>,
    distance: f32,
}

/// Zero crossing on a grid edge. The key identifies the edge so that
/// neighbouring tetrahedra share vertices.
#[derive(Clone, Copy)]
struct EdgeVertex {
    key: (usize, usize),
    position: Vector3<f32>,
}

/// Crossings closer than this (as a fraction of the edge) to a corner snap to it.
const CORNER_SNAP: f32 = 1e-4;

fn edge_vertex(a: &Corner, b: &Corner) -> EdgeVertex {
    let t = a.distance / (a.distance - b.distance);
    if t < CORNER_SNAP {
        return EdgeVertex {
            key: (a.key, a.key),
            position: a.position,
        };
    }
    if t > 1.0 - CORNER_SNAP {
        return EdgeVertex {
            key: (b.key, b.key),
            position: b.position,
        };
    }
    EdgeVertex {
        key: (a.key.min(b.key), a.key.max(b.key)),
        position: a.position + (b.position - a.position) * t,
    }
}

/// Emits the triangles of one tetrahedron, facing free space.
fn polygonize_tetrahedron(corners: [&Corner; 4], triangles: &mut Vec<[EdgeVertex; 3]>) {
    let (inside, outside): (Vec<&Corner>, Vec<&Corner>) =
        corners.into_iter().partition(|corner| corner.distance < 0.0);

    let mut emit = |mut triangle: [EdgeVertex; 3]| {
        let centroid = |list: &[&Corner]| {
            list.iter().map(|c| c.position).sum::<Vector3<f32>>() / list.len() as f32
        };
        let outward = centroid(&outside) - centroid(&inside);
        let normal = (triangle[1].position - triangle[0].position)
            .cross(&(triangle[2].position - triangle[0].position));
        if normal.dot(&outward) < 0.0 {
            triangle.swap(1, 2);
        }
        triangles.push(triangle);
    };

    match (inside.len(), outside.len()) {
        (1, 3) => emit([
            edge_vertex(inside[0], outside[0]),
            edge_vertex(inside[0], outside[1]),
            edge_vertex(inside[0], outside[2]),
        ]),
        (3, 1) => emit([
            edge_vertex(outside[0], inside[0]),
            edge_vertex(outside[0], inside[1]),
            edge_vertex(outside[0], inside[2]),
        ]),
        (2, 2) => {
            // The four crossings form a quad: i0o0, i0o1, i1o1, i1o0.
            let q0 = edge_vertex(inside[0], outside[0]);
            let q1 = edge_vertex(inside[0], outside[1]);
            let q2 = edge_vertex(inside[1], outside[1]);
            let q3 = edge_vertex(inside[1], outside[0]);
            emit([q0, q1, q2]);
            emit([q0, q2, q3]);
        }
        _ => (),
    }
}

/// Maps a unit normal to a display color, `[-1, 1]` onto `[0, 255]` per axis.
pub fn normal_to_rgb(normal: &Vector3<f32>) -> [u8; 3] {
    [0, 1, 2].map(|c| ((normal[c] * 0.5 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8)
}

/// Rounds an accumulated `[0, 255]` color to bytes.
pub fn color_to_rgb(color: &Vector3<f32>) -> [u8; 3] {
    [0, 1, 2].map(|c| color[c].round().clamp(0.0, 255.0) as u8)
}

/// Extracts the zero level set of a [`VoxelGrid`] as a triangle mesh by
/// marching tetrahedra.
#[derive(Debug, Clone, Default)]
pub struct MeshExtractor {
    /// Cubes with any corner weight at or below this are skipped.
    pub min_weight: f32,
}

impl MeshExtractor {
    pub fn new(min_weight: f32) -> Self {
        Self { min_weight }
    }

    /// Triangles of the cubes whose lower corner lies on slice `i`.
    fn extract_slice(&self, grid: &VoxelGrid, i: usize) -> Vec<[EdgeVertex; 3]> {
        let [_, ny, nz] = grid.dims();
        let mut triangles = Vec::new();

        for j in 0..ny - 1 {
            for k in 0..nz - 1 {
                let mut corners = [Corner {
                    key: 0,
                    position: Vector3::zeros(),
                    distance: 0.0,
                }; 8];
                let mut observed = true;
                let mut positive = false;
                let mut negative = false;
                for (corner, offset) in corners.iter_mut().zip(CUBE_CORNERS.iter()) {
                    let index = [i + offset[0], j + offset[1], k + offset[2]];
                    if grid.weight[index] <= self.min_weight {
                        observed = false;
                        break;
                    }
                    let distance = grid.distance[index];
                    positive |= distance >= 0.0;
                    negative |= distance < 0.0;
                    *corner = Corner {
                        key: (index[0] * ny + index[1]) * nz + index[2],
                        position: grid.cell_position(index),
                        distance,
                    };
                }
                if !observed || !(positive && negative) {
                    continue;
                }

                for tetrahedron in CUBE_TETRAHEDRA.iter() {
                    polygonize_tetrahedron(
                        [
                            &corners[tetrahedron[0]],
                            &corners[tetrahedron[1]],
                            &corners[tetrahedron[2]],
                            &corners[tetrahedron[3]],
                        ],
                        &mut triangles,
                    );
                }
            }
        }
        triangles
    }

    /// Extracts the mesh. An unobserved grid yields an empty mesh.
    pub fn extract(&self, grid: &VoxelGrid) -> TriangleMesh {
        let slices = (0..grid.dims()[0] - 1)
            .into_par_iter()
            .map(|i| self.extract_slice(grid, i))
            .collect::<Vec<_>>();

        let mut vertex_map = HashMap::new();
        let mut positions = Vec::new();
        let mut faces = Vec::new();
        for triangle in slices.iter().flatten() {
            let mut face = [0usize; 3];
            for (slot, vertex) in face.iter_mut().zip(triangle.iter()) {
                *slot = *vertex_map.entry(vertex.key).or_insert_with(|| {
                    positions.push(vertex.position);
                    positions.len() - 1
                });
            }
            // Crossings snapped onto a shared corner collapse their triangle.
            if face[0] != face[1] && face[1] != face[2] && face[0] != face[2] {
                faces.push(face);
            }
        }

        if faces.is_empty() {
            debug!("extracted empty mesh");
            return TriangleMesh::empty();
        }

        let vertices = Array2::from_shape_fn((positions.len(), 3), |(v, c)| positions[v][c]);
        let faces = Array2::from_shape_fn((faces.len(), 3), |(f, c)| faces[f][c]);
        let mut mesh = TriangleMesh {
            vertices,
            faces,
            normals: None,
            colors: None,
        };
        mesh.compute_normals();

        // Fused color where the surface received one, normal shading elsewhere.
        let vertex_colors = mesh.normals.as_ref().map(|normals| {
            let rgb = positions
                .par_iter()
                .enumerate()
                .map(|(v, position)| match grid.sample_color(position) {
                    Some(color) => color_to_rgb(&color),
                    None => {
                        let normal = grid.normal(position).unwrap_or_else(|| {
                            Vector3::new(normals[(v, 0)], normals[(v, 1)], normals[(v, 2)])
                        });
                        normal_to_rgb(&normal)
                    }
                })
                .collect::<Vec<_>>();
            Array2::from_shape_fn((rgb.len(), 3), |(v, c)| rgb[v][c])
        });
        mesh.colors = vertex_colors;
        debug!(
            vertices = mesh.len_vertices(),
            faces = mesh.len_faces(),
            "extracted mesh"
        );
        mesh
    }
}
