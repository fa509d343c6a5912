use nalgebra::{
    Isometry3, Matrix3, Quaternion, Translation3, UnitQuaternion, Vector3,
    Vector6,
};

use std::ops;

/// Rigid transform (rotation and translation). Camera poses are stored as
/// camera-to-world transforms.
#[derive(Clone, Debug, PartialEq)]
pub struct Transform(Isometry3<f32>);

/// Skew-symmetric matrix of `v`, such that `skew(v) * u == v.cross(u)`.
fn skew(v: &Vector3<f32>) -> Matrix3<f32> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Scaled axis of `rotation`. Uses `atan2` so rotations far below the `acos`
/// resolution near identity keep their magnitude.
fn rotation_log(rotation: &UnitQuaternion<f32>) -> Vector3<f32> {
    let quat = rotation.quaternion();
    let (w, imag) = if quat.w < 0.0 {
        (-quat.w, -quat.imag())
    } else {
        (quat.w, quat.imag())
    };
    let imag_norm = imag.norm();
    if imag_norm < 1e-7 {
        imag * (2.0 / w)
    } else {
        imag * (2.0 * imag_norm.atan2(w) / imag_norm)
    }
}

impl Transform {
    pub fn eye() -> Self {
        Self(Isometry3::<f32>::identity())
    }

    /// Creates a transform from a translation and a (not necessarily unit) quaternion.
    pub fn new(translation: &Vector3<f32>, rotation: &Quaternion<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::from_quaternion(*rotation),
        ))
    }

    pub fn from_translation(translation: &Vector3<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::identity(),
        ))
    }

    /// Exponential map from se(3) to SE(3).
    ///
    /// # Arguments
    ///
    /// * `twist` - Twist vector laid out as `[vx, vy, vz, wx, wy, wz]`.
    pub fn exp(twist: &Vector6<f32>) -> Self {
        let v = Vector3::new(twist[0], twist[1], twist[2]);
        let omega = Vector3::new(twist[3], twist[4], twist[5]);
        let theta_sq = omega.norm_squared();
        let omega_hat = skew(&omega);
        let omega_hat_sq = omega_hat * omega_hat;

        let (a, b) = if theta_sq < 1e-10 {
            (0.5 - theta_sq / 24.0, 1.0 / 6.0 - theta_sq / 120.0)
        } else {
            let theta = theta_sq.sqrt();
            (
                (1.0 - theta.cos()) / theta_sq,
                (theta - theta.sin()) / (theta_sq * theta),
            )
        };
        let v_matrix = Matrix3::identity() + omega_hat * a + omega_hat_sq * b;

        Self(Isometry3::from_parts(
            Translation3::from(v_matrix * v),
            UnitQuaternion::from_scaled_axis(omega),
        ))
    }

    /// Logarithm map from SE(3) to se(3), the inverse of [`Transform::exp`].
    pub fn log(&self) -> Vector6<f32> {
        let omega = rotation_log(&self.0.rotation);
        let theta_sq = omega.norm_squared();
        let omega_hat = skew(&omega);
        let omega_hat_sq = omega_hat * omega_hat;

        let c = if theta_sq < 1e-10 {
            1.0 / 12.0 + theta_sq / 720.0
        } else {
            let theta = theta_sq.sqrt();
            (1.0 - theta * theta.sin() / (2.0 * (1.0 - theta.cos()))) / theta_sq
        };
        let v_inv = Matrix3::identity() - omega_hat * 0.5 + omega_hat_sq * c;
        let v = v_inv * self.0.translation.vector;

        Vector6::new(v[0], v[1], v[2], omega[0], omega[1], omega[2])
    }

    pub fn inverse(&self) -> Self {
        Self(self.0.inverse())
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.0.translation.vector
    }

    pub fn quaternion(&self) -> &UnitQuaternion<f32> {
        &self.0.rotation
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f32 {
        self.0.rotation.angle()
    }

    /// Applies only the rotational part to `vector`.
    pub fn rotate(&self, vector: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * vector
    }

    /// Re-normalizes the rotation. Long chains of incremental updates
    /// accumulate round-off that drifts the quaternion away from unit length.
    pub fn renormalize(&mut self) {
        self.0.rotation = UnitQuaternion::new_normalize(self.0.rotation.into_inner());
    }
}

impl ops::Mul<&Vector3<f32>> for &Transform {
    type Output = Vector3<f32>;

    fn mul(self, rhs: &Vector3<f32>) -> Self::Output {
        self.0.transform_point(&(*rhs).into()).coords
    }
}

impl ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    fn mul(self, rhs: &Transform) -> Self::Output {
        Transform(self.0 * rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Transform;
    use approx::assert_relative_eq;
    use nalgebra::{Quaternion, Vector3, Vector6};

    #[test]
    fn test_mul_op() {
        let transform = Transform::eye();
        let point = Vector3::new(1., 2., 3.);
        assert_eq!(&transform * &point, point);

        let transform = Transform::exp(&Vector6::new(
            0.0,
            0.0,
            0.0,
            0.0,
            std::f32::consts::PI,
            0.0,
        ));
        let transform = &Transform::from_translation(&Vector3::new(0.0, 0.0, 3.0)) * &transform;

        assert_relative_eq!(
            &transform * &Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(-1.0, 2.0, 0.0),
            epsilon = 1e-5
        );
    }

    #[test]
    fn exp_should_invert_log() {
        let twist = Vector6::new(0.1, -0.2, 0.05, 0.02, 0.3, -0.1);
        let transform = Transform::exp(&twist);
        assert_relative_eq!(transform.log(), twist, epsilon = 1e-5);

        let small = Vector6::new(1e-3, 2e-3, -1e-3, 1e-6, -2e-6, 1e-6);
        assert_relative_eq!(Transform::exp(&small).log(), small, epsilon = 1e-6);
    }

    #[test]
    fn exp_of_pure_translation_should_translate() {
        let transform = Transform::exp(&Vector6::new(0.5, 0.0, -1.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(transform.translation(), Vector3::new(0.5, 0.0, -1.0));
        assert_eq!(transform.angle(), 0.0);
    }

    #[test]
    fn should_compose_with_inverse_to_identity() {
        let transform = Transform::new(
            &Vector3::new(0.3, 0.1, -0.7),
            &Quaternion::new(0.9, 0.1, 0.2, 0.05),
        );
        let identity = &transform * &transform.inverse();
        assert_relative_eq!(identity.translation(), Vector3::zeros(), epsilon = 1e-5);
        assert!(identity.angle() < 2e-3);
    }

    #[test]
    fn renormalize_should_keep_unit_rotation() {
        let mut transform = Transform::eye();
        let step = Transform::exp(&Vector6::new(0.001, 0.0, 0.0, 0.01, 0.02, -0.01));
        for _ in 0..1000 {
            transform = &step * &transform;
            transform.renormalize();
        }
        assert_relative_eq!(transform.quaternion().norm(), 1.0, epsilon = 1e-6);
    }
}
