use std::io::Write;
use std::ops::Index;
use std::path::Path;

use crate::error::{Error, Result};
use crate::transform::Transform;

/// Camera poses of processed frames, in processing order.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    /// Camera poses, transforms points from camera to world.
    pub camera_to_world: Vec<Transform>,
    /// Timestamps of each pose.
    pub times: Vec<f64>,
}

impl Trajectory {
    /// Adds a new pose to the trajectory.
    pub fn push(&mut self, camera_to_world: Transform, time: f64) {
        self.camera_to_world.push(camera_to_world);
        self.times.push(time);
    }

    pub fn len(&self) -> usize {
        self.camera_to_world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.camera_to_world.is_empty()
    }

    /// Returns the iterator over poses and timestamps.
    pub fn iter(&self) -> impl Iterator<Item = (&Transform, f64)> + '_ {
        self.camera_to_world.iter().zip(self.times.iter().copied())
    }

    /// Gets the last pose and timestamp, `None` if the trajectory is empty.
    pub fn last(&self) -> Option<(&Transform, f64)> {
        self.camera_to_world.last().zip(self.times.last().copied())
    }

    /// Writes one `time tx ty tz qx qy qz qw` line per pose, the format of
    /// the TUM RGB-D benchmark tools.
    pub fn write_tum<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (pose, time) in self.iter() {
            let t = pose.translation();
            let q = pose.quaternion();
            writeln!(
                writer,
                "{time:.6} {} {} {} {} {} {} {}",
                t[0], t[1], t[2], q.i, q.j, q.k, q.w
            )?;
        }
        Ok(())
    }

    pub fn save_tum<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_tum(&mut writer)?;
        writer.flush().map_err(Error::from)
    }
}

impl FromIterator<(Transform, f64)> for Trajectory {
    /// Creates a new trajectory from the `(Transform, f64)` iterator.
    fn from_iter<T: IntoIterator<Item = (Transform, f64)>>(iter: T) -> Self {
        let mut trajectory = Trajectory::default();
        for (transform, time) in iter {
            trajectory.push(transform, time);
        }
        trajectory
    }
}

impl Index<usize> for Trajectory {
    type Output = Transform;

    fn index(&self, index: usize) -> &Self::Output {
        &self.camera_to_world[index]
    }
}
