use std::collections::VecDeque;

use tracing::debug;

use crate::error::{Error, Result};
use crate::kdtree::KdTree;
use crate::pointcloud::PointCloud;

/// Point cloud whose points are labeled with a region id.
#[derive(Clone, Debug)]
pub struct SegmentedPointCloud {
    /// Points of the retained regions, in input order.
    pub cloud: PointCloud,
    /// Region of each point in `cloud`, dense in `0..num_regions`.
    pub labels: Vec<usize>,
    /// Input cloud indices of each region, in discovery order.
    pub regions: Vec<Vec<usize>>,
}

impl SegmentedPointCloud {
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Euclidean region growing over a point cloud.
#[derive(Debug, Clone)]
pub struct SegmentationEngine {
    /// Neighbours closer than this join the same region.
    pub distance_threshold: f32,
    /// Regions with fewer points are discarded.
    pub min_cluster_size: usize,
    /// Maximum angle in radians between neighbouring normals. Ignored when
    /// the cloud has no normals.
    pub max_angle: Option<f32>,
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self {
            distance_threshold: 0.02,
            min_cluster_size: 100,
            max_angle: None,
        }
    }
}

impl SegmentationEngine {
    pub fn new(min_cluster_size: usize, distance_threshold: f32) -> Result<Self> {
        if distance_threshold <= 0.0 || !distance_threshold.is_finite() {
            return Err(Error::invalid_parameter(
                "segmentation distance threshold must be positive",
            ));
        }
        Ok(Self {
            distance_threshold,
            min_cluster_size,
            max_angle: None,
        })
    }

    pub fn with_max_angle(mut self, radians: f32) -> Self {
        self.max_angle = Some(radians);
        self
    }

    /// Splits the cloud into regions. Seeds are taken in input order, so the
    /// result only depends on the cloud.
    pub fn segment(&self, cloud: &PointCloud) -> SegmentedPointCloud {
        let tree = KdTree::new(&cloud.points.view());
        let min_cos = self
            .max_angle
            .filter(|_| cloud.normals.is_some())
            .map(|angle| angle.cos());

        let mut visited = vec![false; cloud.len()];
        let mut regions = Vec::new();
        let mut queue = VecDeque::new();
        let mut neighbours = Vec::new();
        let mut num_discarded = 0;

        for seed in 0..cloud.len() {
            if visited[seed] {
                continue;
            }
            visited[seed] = true;
            queue.push_back(seed);

            let mut region = Vec::new();
            while let Some(current) = queue.pop_front() {
                region.push(current);

                neighbours.clear();
                tree.radius_search_into(&cloud.point(current), self.distance_threshold, &mut neighbours);
                let current_normal = cloud.normal(current);
                for &neighbour in neighbours.iter() {
                    if visited[neighbour] {
                        continue;
                    }
                    if let (Some(min_cos), Some(n0), Some(n1)) =
                        (min_cos, current_normal, cloud.normal(neighbour))
                    {
                        if n0.dot(&n1) < min_cos {
                            continue;
                        }
                    }
                    visited[neighbour] = true;
                    queue.push_back(neighbour);
                }
            }

            if region.len() >= self.min_cluster_size {
                region.sort_unstable();
                regions.push(region);
            } else {
                num_discarded += 1;
            }
        }

        let mut labels_by_index = vec![None; cloud.len()];
        for (label, region) in regions.iter().enumerate() {
            for index in region {
                labels_by_index[*index] = Some(label);
            }
        }
        let (kept, labels): (Vec<usize>, Vec<usize>) = labels_by_index
            .iter()
            .enumerate()
            .filter_map(|(index, label)| label.map(|label| (index, label)))
            .unzip();

        debug!(
            regions = regions.len(),
            num_discarded,
            points = kept.len(),
            "segmented point cloud"
        );
        SegmentedPointCloud {
            cloud: cloud.select(&kept),
            labels,
            regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;
    use ndarray::Array2;

    use super::*;

    /// Two 10x10 patches 11 cm apart plus a stray point.
    fn two_patches() -> PointCloud {
        let mut points = Vec::new();
        for offset in [0.0, 0.2] {
            for i in 0..10 {
                for j in 0..10 {
                    points.push(Vector3::new(offset + i as f32 * 0.01, j as f32 * 0.01, 0.5));
                }
            }
        }
        points.push(Vector3::new(1.0, 1.0, 1.0));
        PointCloud::from_points(&points)
    }

    #[test]
    fn should_split_separated_patches() {
        let engine = SegmentationEngine::new(10, 0.015).unwrap();
        let segmented = engine.segment(&two_patches());

        assert_eq!(segmented.num_regions(), 2);
        assert_eq!(segmented.cloud.len(), 200);
        assert_eq!(segmented.labels.len(), 200);
        assert!(segmented.labels[..100].iter().all(|l| *l == 0));
        assert!(segmented.labels[100..].iter().all(|l| *l == 1));
    }

    #[test]
    fn should_merge_with_large_threshold() {
        let segmented = SegmentationEngine::new(10, 0.5).unwrap().segment(&two_patches());
        assert_eq!(segmented.num_regions(), 1);
        assert_eq!(segmented.regions[0].len(), 200);
    }

    #[test]
    fn should_discard_small_regions() {
        let segmented = SegmentationEngine::new(150, 0.015).unwrap().segment(&two_patches());
        assert!(segmented.is_empty());
        assert!(segmented.cloud.is_empty());
    }

    #[test]
    fn should_be_deterministic() {
        let engine = SegmentationEngine::new(5, 0.015).unwrap();
        let first = engine.segment(&two_patches());
        let second = engine.segment(&two_patches());
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.regions, second.regions);
    }

    #[test]
    fn should_split_on_normal_discontinuity() {
        // A fold: same positions as one patch, but normals flip halfway.
        let mut cloud = PointCloud::from_points(
            &(0..20)
                .map(|i| Vector3::new(i as f32 * 0.01, 0.0, 0.0))
                .collect::<Vec<_>>(),
        );
        cloud.normals = Some(Array2::from_shape_fn((20, 3), |(i, c)| match (i < 10, c) {
            (true, 2) => 1.0,
            (false, 0) => 1.0,
            _ => 0.0,
        }));

        let without_angle = SegmentationEngine::new(1, 0.015).unwrap();
        assert_eq!(without_angle.segment(&cloud).num_regions(), 1);

        let with_angle = without_angle.with_max_angle(0.5);
        let segmented = with_angle.segment(&cloud);
        assert_eq!(segmented.num_regions(), 2);
        assert_eq!(segmented.regions[0], (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn should_reject_bad_threshold() {
        assert!(SegmentationEngine::new(10, 0.0).is_err());
    }
}
