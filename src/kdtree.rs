use nalgebra::Vector3;
use ndarray::prelude::*;
use ordered_float::OrderedFloat;

const LEAF_SIZE: usize = 16;

enum KdNode {
    Leaf {
        points: Vec<Vector3<f32>>,
        indices: Vec<usize>,
    },
    NonLeaf {
        axis: usize,
        middle_value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

/// KdTree over 3D points for fixed radius queries.
pub struct KdTree {
    root: KdNode,
    len: usize,
}

impl KdTree {
    /// Create a new KdTree from a set of points.
    /// The points are stored in a 2D array, where each row is a point.
    ///
    /// # Arguments
    ///
    /// * points - (N, 3) array of points.
    pub fn new(points: &ArrayView2<f32>) -> Self {
        let points = points
            .rows()
            .into_iter()
            .map(|row| Vector3::new(row[0], row[1], row[2]))
            .collect::<Vec<_>>();

        // Recursive creation, splitting on the median of alternating axes.
        fn rec(points: &[Vector3<f32>], mut indices: Vec<usize>, depth: usize) -> KdNode {
            if indices.len() <= LEAF_SIZE {
                return KdNode::Leaf {
                    points: indices.iter().map(|idx| points[*idx]).collect(),
                    indices,
                };
            }

            let axis = depth % 3;
            indices.sort_by_key(|idx| OrderedFloat(points[*idx][axis]));

            let mid = indices.len() / 2;
            let right = indices.split_off(mid);
            KdNode::NonLeaf {
                axis,
                middle_value: points[right[0]][axis],
                left: Box::new(rec(points, indices, depth + 1)),
                right: Box::new(rec(points, right, depth + 1)),
            }
        }

        let indices = Vec::from_iter(0..points.len());
        KdTree {
            root: rec(&points, indices, 0),
            len: points.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indices of every point within `radius` of `point`, unordered.
    pub fn radius_search(&self, point: &Vector3<f32>, radius: f32) -> Vec<usize> {
        let mut found = Vec::new();
        self.radius_search_into(point, radius, &mut found);
        found
    }

    /// Same as [`Self::radius_search`] but appends into `found`.
    pub fn radius_search_into(&self, point: &Vector3<f32>, radius: f32, found: &mut Vec<usize>) {
        let radius_sqr = radius * radius;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            match node {
                KdNode::Leaf { points, indices } => {
                    found.extend(
                        points
                            .iter()
                            .zip(indices)
                            .filter(|(leaf_point, _)| (point - *leaf_point).norm_squared() <= radius_sqr)
                            .map(|(_, idx)| *idx),
                    );
                }
                KdNode::NonLeaf {
                    axis,
                    middle_value,
                    left,
                    right,
                } => {
                    if point[*axis] - radius <= *middle_value {
                        stack.push(left.as_ref());
                    }
                    if point[*axis] + radius >= *middle_value {
                        stack.push(right.as_ref());
                    }
                }
            }
        }
    }
}
