use glam::{Mat4, Vec3};

/// Free-flying camera with yaw and pitch in radians. At zero rotation it
/// looks down negative Z.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
    pub aspect: f32,
    pub depth_range: (f32, f32),
}

const PITCH_LIMIT: f32 = 0.49 * std::f32::consts::PI;

impl Camera {
    pub fn new(position: Vec3, aspect: f32) -> Self {
        Camera {
            position,
            yaw: 0.0,
            pitch: 0.0,
            fov_y: 0.8,
            aspect,
            depth_range: (0.1, 1000.0),
        }
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.pitch.cos() * self.yaw.sin(),
            self.pitch.sin(),
            -self.pitch.cos() * self.yaw.cos(),
        )
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    pub fn up(&self) -> Vec3 {
        self.right().cross(self.forward())
    }

    pub fn rotate(&mut self, d_yaw: f32, d_pitch: f32) {
        self.yaw += d_yaw;
        self.pitch = (self.pitch + d_pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), self.up())
    }

    /// Perspective projection with the Y axis flipped for Vulkan clip
    /// space.
    pub fn projection(&self) -> Mat4 {
        let (near, far) = self.depth_range;
        let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, near, far);
        proj.y_axis.y = -proj.y_axis.y;
        proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_pose_looks_down_negative_z() {
        let camera = Camera::new(Vec3::ZERO, 1.0);
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-6);
        assert!((camera.right() - Vec3::X).length() < 1e-6);
        assert!((camera.up() - Vec3::Y).length() < 1e-6);
    }

    #[test]
    fn basis_stays_orthonormal() {
        let mut camera = Camera::new(Vec3::new(3.0, 2.0, 1.0), 1.5);
        camera.rotate(1.2, -0.7);
        let (f, r, u) = (camera.forward(), camera.right(), camera.up());
        assert!(f.dot(r).abs() < 1e-6);
        assert!(f.dot(u).abs() < 1e-6);
        assert!(r.dot(u).abs() < 1e-6);
        assert!((f.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pitch_never_reaches_the_pole() {
        let mut camera = Camera::new(Vec3::ZERO, 1.0);
        camera.rotate(0.0, 10.0);
        assert!(camera.pitch < std::f32::consts::FRAC_PI_2);
        assert!(camera.up().y > 0.0);
    }

    #[test]
    fn view_matrix_inverts_cleanly() {
        let mut camera = Camera::new(Vec3::new(-2.0, 4.0, 6.0), 1.33);
        camera.rotate(0.5, 0.25);
        let round_trip = camera.view() * camera.view().inverse();
        assert!(round_trip.abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }
}
