use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use ndarray::Array3;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::camera::PinholeCamera;
use crate::error::{Error, Result};
use crate::fusion::{FusionEngine, FusionSummary};
use crate::image::{ColorImage, DepthFrame, DepthImage};
use crate::io;
use crate::mesh::{MeshExtractor, TriangleMesh};
use crate::params::SdfParameters;
use crate::pointcloud::{PointCloud, SurfaceSampler};
use crate::raycast::Raycaster;
use crate::segmentation::{SegmentationEngine, SegmentedPointCloud};
use crate::tracking::{PoseEstimate, PoseTracker, TrackerParams};
use crate::trajectory::Trajectory;
use crate::transform::Transform;
use crate::volume::VoxelGrid;

/// Result of processing one frame.
#[derive(Clone, Debug)]
pub struct FrameStatus {
    /// Camera to world pose after the frame.
    pub pose: Transform,
    /// False when the frame had too few usable measurements. The pose is then
    /// held at its previous value.
    pub tracking_valid: bool,
    /// Whether the frame was integrated into the volume.
    pub fused: bool,
    /// Whether the optimizer met its convergence criterion. A non-converged
    /// estimate is still applied.
    pub converged: bool,
    pub iterations: usize,
    pub valid_residuals: usize,
}

/// Outputs written by [`SdfTracker::finalize`]. Unset paths are skipped.
#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    pub mesh_path: Option<PathBuf>,
    pub volume_path: Option<PathBuf>,
    pub trajectory_path: Option<PathBuf>,
}

/// Shared stop flag. Clones observe the same flag, so a signal handler or
/// another thread may request termination.
#[derive(Clone, Debug, Default)]
pub struct TerminationHandle(Arc<AtomicBool>);

impl TerminationHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Observation<'a> {
    Depth(&'a DepthFrame, Option<&'a ColorImage>),
    Points(&'a [Vector3<f32>]),
}

/// Tracks a depth camera against a signed distance volume and fuses its
/// frames into it.
///
/// Frames are processed one at a time. The volume sits behind a read-write
/// lock: frame processing holds the write lock for the whole
/// track-then-fuse cycle, while extraction and rendering only take read
/// locks and may run from other threads through [`SdfTracker::grid`].
pub struct SdfTracker {
    params: SdfParameters,
    grid: Arc<RwLock<VoxelGrid>>,
    tracker: PoseTracker,
    fusion: FusionEngine,
    raycaster: Raycaster,
    pose: Transform,
    last_fused_pose: Option<Transform>,
    pending_color: Option<ColorImage>,
    trajectory: Trajectory,
    num_frames: usize,
    termination: TerminationHandle,
}

impl SdfTracker {
    /// Validates the parameters and allocates an unobserved volume. The
    /// camera starts at `params.pose_offset`.
    pub fn configure(params: SdfParameters) -> Result<Self> {
        params.validate()?;
        let grid = VoxelGrid::from_params(&params)?;
        let tracker_params = TrackerParams::from(&params);
        tracker_params.validate()?;

        info!(
            grid_size = ?params.grid_size,
            resolution = params.resolution,
            use_color = params.use_color,
            "configured volume"
        );
        Ok(Self {
            pose: Transform::from_translation(&Vector3::from(params.pose_offset)),
            grid: Arc::new(RwLock::new(grid)),
            tracker: PoseTracker::new(tracker_params),
            fusion: FusionEngine::default(),
            raycaster: Raycaster::new(params.raycast_steps),
            last_fused_pose: None,
            pending_color: None,
            trajectory: Trajectory::default(),
            num_frames: 0,
            termination: TerminationHandle::default(),
            params,
        })
    }

    pub fn params(&self) -> &SdfParameters {
        &self.params
    }

    /// Current camera to world pose.
    pub fn pose(&self) -> &Transform {
        &self.pose
    }

    /// Overrides the camera pose, e.g. to map with externally known poses
    /// while tracking is disabled.
    pub fn set_pose(&mut self, pose: Transform) {
        self.pose = pose;
    }

    /// Handle to the volume for concurrent readers.
    pub fn grid(&self) -> Arc<RwLock<VoxelGrid>> {
        Arc::clone(&self.grid)
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Latches a color image for the next fused depth frame. A newer image
    /// replaces a pending one.
    pub fn attach_color_frame(&mut self, color: ColorImage) {
        if self.pending_color.replace(color).is_some() {
            debug!("replaced pending color frame");
        }
    }

    pub fn has_pending_color(&self) -> bool {
        self.pending_color.is_some()
    }

    /// Tracks a depth frame against the volume, then fuses it.
    ///
    /// # Arguments
    ///
    /// * `frame` - Depth in meters with the intrinsics of the sensor.
    /// * `color` - Registered color image for this frame. Takes precedence
    ///   over a latched color frame.
    ///
    /// # Returns
    ///
    /// * The frame status. Tracking loss is reported there, errors are only
    ///   returned for frames that cannot be processed at all, in which case
    ///   nothing is modified.
    pub fn process_depth_frame(
        &mut self,
        frame: &DepthFrame,
        color: Option<&ColorImage>,
    ) -> Result<FrameStatus> {
        if let Err(err) = frame.check() {
            warn!(%err, "skipping malformed depth frame");
            return Err(err);
        }
        if let Some(color) = color {
            let (height, width, _) = color.dim();
            if (height, width) != (frame.height(), frame.width()) {
                warn!("skipping frame with mismatched color image");
                return Err(Error::invalid_parameter(format!(
                    "color image is {width}x{height}, depth frame is {}x{}",
                    frame.width(),
                    frame.height()
                )));
            }
        }
        Ok(self.process(Observation::Depth(frame, color)))
    }

    /// Tracks and fuses an unordered set of camera-frame points.
    pub fn process_points(&mut self, points: &[Vector3<f32>]) -> FrameStatus {
        self.process(Observation::Points(points))
    }

    fn process(&mut self, observation: Observation<'_>) -> FrameStatus {
        let mut grid = self.grid.write();
        let frame_index = self.num_frames;
        self.num_frames += 1;

        let num_measurements = match &observation {
            Observation::Depth(frame, _) => frame.valid_count(),
            Observation::Points(points) => points
                .iter()
                .filter(|p| p.iter().all(|c| c.is_finite()))
                .count(),
        };

        let estimate = if num_measurements == 0 {
            warn!(frame_index, "frame has no valid measurements");
            Some(PoseEstimate::lost(0))
        } else if grid.is_unobserved() {
            debug!(frame_index, "bootstrapping empty volume");
            None
        } else if self.params.tracking_enabled {
            Some(match &observation {
                Observation::Depth(frame, _) => {
                    self.tracker.estimate_pose(&grid, frame, &self.pose)
                }
                Observation::Points(points) => {
                    self.tracker.estimate_pose_points(&grid, points, &self.pose)
                }
            })
        } else {
            None
        };

        let tracking_valid = estimate.as_ref().map_or(true, |estimate| estimate.valid);
        if let Some(estimate) = &estimate {
            if estimate.valid {
                self.pose = estimate.apply(&self.pose);
            } else if num_measurements > 0 {
                warn!(
                    frame_index,
                    valid_residuals = estimate.valid_residuals,
                    "tracking lost, holding pose"
                );
            }
        }

        let should_fuse = num_measurements > 0
            && (tracking_valid || self.params.fuse_when_lost)
            && self.moved_enough();
        let summary = if should_fuse {
            let summary = match observation {
                Observation::Depth(frame, color) => {
                    let pending = self.pending_color.take();
                    let color = color.or(pending.as_ref());
                    self.fusion.fuse(&mut grid, frame, &self.pose, color)
                }
                Observation::Points(points) => {
                    self.fusion.fuse_points(&mut grid, points, &self.pose)
                }
            };
            self.last_fused_pose = Some(self.pose.clone());
            summary
        } else {
            debug!(frame_index, "fusion skipped");
            FusionSummary::default()
        };

        self.trajectory.push(self.pose.clone(), frame_index as f64);
        let status = FrameStatus {
            pose: self.pose.clone(),
            tracking_valid,
            fused: should_fuse,
            converged: estimate.as_ref().map_or(true, |estimate| estimate.converged),
            iterations: estimate.as_ref().map_or(0, |estimate| estimate.iterations),
            valid_residuals: estimate
                .as_ref()
                .map_or(num_measurements, |estimate| estimate.valid_residuals),
        };
        debug!(
            frame_index,
            tracking_valid,
            fused = status.fused,
            iterations = status.iterations,
            updated_cells = summary.num_updated,
            "processed frame"
        );
        status
    }

    /// Whether the camera moved at least `min_pose_change` since the last
    /// fused frame.
    fn moved_enough(&self) -> bool {
        match &self.last_fused_pose {
            None => true,
            Some(last) => {
                (&last.inverse() * &self.pose).log().norm() >= self.params.min_pose_change
            }
        }
    }

    fn camera(&self) -> PinholeCamera {
        PinholeCamera::new(
            self.params.intrinsics.clone(),
            self.pose.clone(),
            self.params.image_width,
            self.params.image_height,
        )
    }

    /// Raycasts the volume from the current pose.
    pub fn get_denoised_depth(&self) -> DepthImage {
        self.raycaster.render(&self.grid.read(), &self.camera())
    }

    /// Raycasts depth and world-frame normals from the current pose.
    pub fn render_normals(&self) -> (DepthImage, Array3<f32>) {
        self.raycaster.render_normals(&self.grid.read(), &self.camera())
    }

    pub fn extract_mesh(&self) -> TriangleMesh {
        MeshExtractor::default().extract(&self.grid.read())
    }

    /// Samples the cells inside the sampler's band. Colors are included when
    /// the volume stores them.
    pub fn extract_point_cloud(&self, sampler: &SurfaceSampler) -> PointCloud {
        let grid = self.grid.read();
        if grid.has_color() {
            sampler.sample_band_rgb(&grid).unwrap_or_else(|_| sampler.sample_band(&grid))
        } else {
            sampler.sample_band(&grid)
        }
    }

    pub fn segment(&self, cloud: &PointCloud, engine: &SegmentationEngine) -> SegmentedPointCloud {
        engine.segment(cloud)
    }

    pub fn save_volume<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        io::save_volume(&self.grid.read(), path)
    }

    /// Replaces the volume with the one stored at `path`. On failure the
    /// current volume is kept.
    pub fn load_volume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let loaded = io::load_volume(path)?;
        if self.params.use_color && !loaded.has_color() {
            warn!("loaded volume has no colors, color fusion is disabled");
        }
        *self.grid.write() = loaded;
        self.last_fused_pose = None;
        Ok(())
    }

    pub fn termination_handle(&self) -> TerminationHandle {
        self.termination.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_requested()
    }

    /// Best-effort export of the requested outputs. Failures are logged and
    /// the remaining outputs are still attempted.
    ///
    /// # Returns
    ///
    /// * Whether every requested output was written.
    pub fn finalize(&self, options: &ExportOptions) -> bool {
        let mut all_written = true;
        let mut report = |what: &str, result: Result<()>| {
            if let Err(err) = result {
                warn!(%err, "failed to export {what}");
                all_written = false;
            }
        };

        if let Some(path) = &options.mesh_path {
            report("mesh", io::write_mesh_ply(path, &self.extract_mesh()));
        }
        if let Some(path) = &options.volume_path {
            report("volume", self.save_volume(path));
        }
        if let Some(path) = &options.trajectory_path {
            report("trajectory", self.trajectory.save_tum(path));
        }
        all_written
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rstest::rstest;

    use super::*;
    use crate::unit_test::{planar_frame, test_intrinsics};

    fn test_params() -> SdfParameters {
        SdfParameters::default()
            .with_grid_size(100, 100, 100)
            .with_resolution(0.01)
            .with_intrinsics(test_intrinsics())
            .with_image_size(80, 60)
            .with_pose_offset(Vector3::zeros())
    }

    #[rstest]
    fn should_bootstrap_with_first_frame(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        let status = system.process_depth_frame(&planar_frame, None).unwrap();

        assert!(status.tracking_valid);
        assert!(status.fused);
        assert_eq!(status.pose, Transform::eye());
        assert!(!system.grid().read().is_unobserved());
        assert_eq!(system.trajectory().len(), 1);
    }

    #[rstest]
    fn should_gate_fusion_of_static_views(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        let status = system.process_depth_frame(&planar_frame, None).unwrap();

        assert!(status.tracking_valid);
        assert!(!status.fused);
        assert_eq!(system.grid().read().weight([50, 50, 80]), 1.0);
    }

    #[rstest]
    fn degenerate_frame_should_not_change_state(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        let before = system.grid().read().clone();
        let pose = system.pose().clone();

        let empty = DepthFrame::new(Array2::zeros((60, 80)), test_intrinsics());
        let status = system.process_depth_frame(&empty, None).unwrap();

        assert!(!status.tracking_valid);
        assert!(!status.fused);
        assert_eq!(status.valid_residuals, 0);
        assert_eq!(system.pose(), &pose);
        assert_eq!(system.grid().read().distance, before.distance);
        assert_eq!(system.grid().read().weight, before.weight);
    }

    #[rstest]
    fn should_fuse_at_given_pose_without_tracking(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params().with_tracking(false)).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();

        let pose = Transform::from_translation(&Vector3::new(0.0, 0.0, 0.05));
        system.set_pose(pose.clone());
        let status = system.process_depth_frame(&planar_frame, None).unwrap();

        assert!(status.fused);
        assert_eq!(status.iterations, 0);
        assert_eq!(status.pose, pose);
        // -0.02 from the first view averaged with 0.03 from the second.
        assert_relative_eq!(system.grid().read().distance([50, 50, 82]), 0.005, epsilon = 1e-5);
    }

    #[rstest]
    fn should_consume_latched_color(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params().with_color(true)).unwrap();
        let mut color = Array3::<u8>::zeros((60, 80, 3));
        color.fill(90);
        system.attach_color_frame(color.clone());
        system.attach_color_frame(color);
        assert!(system.has_pending_color());

        system.process_depth_frame(&planar_frame, None).unwrap();
        assert!(!system.has_pending_color());
        assert_eq!(
            system.grid().read().color([50, 50, 80]),
            Some(Vector3::new(90.0, 90.0, 90.0))
        );
    }

    #[rstest]
    fn should_reject_malformed_frames(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.attach_color_frame(Array3::zeros((60, 80, 3)));

        let empty = DepthFrame::new(Array2::zeros((0, 0)), test_intrinsics());
        assert!(system.process_depth_frame(&empty, None).is_err());

        let small_color = Array3::zeros((10, 10, 3));
        assert!(system
            .process_depth_frame(&planar_frame, Some(&small_color))
            .is_err());

        assert!(system.has_pending_color());
        assert!(system.grid().read().is_unobserved());
        assert!(system.trajectory().is_empty());
    }

    #[rstest]
    fn should_render_fused_plane(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();

        let depth = system.get_denoised_depth();
        assert_eq!(depth.dim(), (60, 80));
        assert_relative_eq!(depth[(30, 40)], 0.3, epsilon = 1e-3);

        let (_, normals) = system.render_normals();
        assert_relative_eq!(normals[(30, 40, 2)], -1.0, epsilon = 1e-3);
    }

    #[test]
    fn fresh_volume_should_extract_nothing() {
        let system = SdfTracker::configure(test_params()).unwrap();
        assert!(system.extract_mesh().is_empty());
        let cloud = system.extract_point_cloud(&SurfaceSampler::default());
        assert!(cloud.is_empty());
        assert!(system
            .segment(&cloud, &SegmentationEngine::default())
            .is_empty());
    }

    #[rstest]
    fn failed_load_should_keep_volume(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.sdfv");
        system.save_volume(&path).unwrap();

        let mut other = SdfTracker::configure(test_params()).unwrap();
        assert!(other.load_volume(dir.path().join("missing.sdfv")).is_err());
        assert!(other.grid().read().is_unobserved());

        other.load_volume(&path).unwrap();
        assert_eq!(other.grid().read().distance, system.grid().read().distance);
    }

    #[test]
    fn should_observe_termination_requests() {
        let system = SdfTracker::configure(test_params()).unwrap();
        assert!(!system.is_terminated());
        let handle = system.termination_handle();
        std::thread::spawn(move || handle.request()).join().unwrap();
        assert!(system.is_terminated());
    }

    #[rstest]
    fn finalize_should_write_outputs(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let options = ExportOptions {
            mesh_path: Some(dir.path().join("mesh.ply")),
            volume_path: Some(dir.path().join("volume.sdfv")),
            trajectory_path: Some(dir.path().join("missing_dir").join("trajectory.txt")),
        };
        assert!(!system.finalize(&options));
        assert!(dir.path().join("mesh.ply").exists());
        assert!(dir.path().join("volume.sdfv").exists());
    }

    /// Camera-frame points of the inner pixels of a wall `depth` meters ahead.
    fn wall_points(depth: f32) -> Vec<Vector3<f32>> {
        let frame = DepthFrame::new(Array2::from_elem((60, 80), depth), test_intrinsics());
        (5..55)
            .flat_map(|v| (5..75).map(move |u| (u, v)))
            .filter_map(|(u, v)| frame.point(u, v))
            .collect()
    }

    #[test]
    fn points_should_bootstrap_empty_volume() {
        let mut system = SdfTracker::configure(test_params()).unwrap();
        let status = system.process_points(&[Vector3::new(0.0, 0.0, 0.3)]);

        assert!(status.tracking_valid);
        assert!(status.fused);
        assert_eq!(status.pose, Transform::eye());
        assert_relative_eq!(system.grid().read().distance([50, 50, 80]), 0.0, epsilon = 1e-5);
    }

    #[rstest]
    fn should_track_and_fuse_point_sets(planar_frame: DepthFrame) {
        let mut params = test_params().with_min_pose_change(0.005);
        params.robust_statistic_coefficient = 0.5;
        let mut system = SdfTracker::configure(params).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();

        // The camera moved 1 cm towards the wall.
        let status = system.process_points(&wall_points(0.29));

        assert!(status.tracking_valid);
        assert!(status.iterations > 0);
        let translation = status.pose.translation();
        assert_relative_eq!(translation[2], 0.01, epsilon = 2e-3);
        assert!(translation[0].abs() < 1e-3 && translation[1].abs() < 1e-3);
        assert!(status.fused);
        assert_eq!(system.trajectory().len(), 2);
    }

    #[rstest]
    fn lost_frames_should_not_fuse_by_default(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params().with_min_pose_change(0.0)).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();

        // A wall beyond the volume leaves nothing to track against.
        let far_wall = DepthFrame::new(Array2::from_elem((60, 80), 3.0), test_intrinsics());
        let status = system.process_depth_frame(&far_wall, None).unwrap();

        assert!(!status.tracking_valid);
        assert!(!status.fused);
        assert_eq!(system.grid().read().weight([50, 50, 60]), 1.0);
    }

    #[rstest]
    fn lost_frames_should_fuse_at_last_good_pose_when_enabled(planar_frame: DepthFrame) {
        let mut params = test_params().with_min_pose_change(0.0);
        params.fuse_when_lost = true;
        let mut system = SdfTracker::configure(params).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        let pose = system.pose().clone();

        let far_wall = DepthFrame::new(Array2::from_elem((60, 80), 3.0), test_intrinsics());
        let status = system.process_depth_frame(&far_wall, None).unwrap();

        assert!(!status.tracking_valid);
        assert!(status.fused);
        assert_eq!(status.pose, pose);
        let grid_handle = system.grid();
        let grid = grid_handle.read();
        assert_eq!(grid.weight([50, 50, 60]), 2.0);
        // The old surface is pulled towards the free space of the far wall.
        assert_relative_eq!(grid.distance([50, 50, 80]), 0.05, epsilon = 1e-5);
    }

    #[rstest]
    fn depth_only_fusion_should_not_blacken_mesh(planar_frame: DepthFrame) {
        let mut system = SdfTracker::configure(test_params().with_color(true)).unwrap();
        system.process_depth_frame(&planar_frame, None).unwrap();
        assert_eq!(system.grid().read().color([50, 50, 80]), None);

        let mesh = system.extract_mesh();
        let colors = mesh.colors.as_ref().unwrap();
        assert!(colors.nrows() > 0);
        for color in colors.rows() {
            assert_ne!(color.to_vec(), vec![0, 0, 0]);
        }

        let cloud = system.extract_point_cloud(&SurfaceSampler::default());
        let colors = cloud.colors.unwrap();
        assert!(colors.rows().into_iter().all(|color| color.to_vec() != vec![0, 0, 0]));
    }

    #[test]
    fn should_reject_invalid_params() {
        assert!(SdfTracker::configure(test_params().with_truncation(0.1, 0.1)).is_err());
    }
}
