use glam::Vec3;
use winit::event::{ElementState, MouseButton};

use pathtracer_shared::{Camera, RaytracerConfig};

/// Input handling state
pub struct InputState {
    mouse_pressed: bool,
    last_mouse_pos: Option<(f64, f64)>,
}

impl InputState {
    pub fn new() -> Self {
        Self {
            mouse_pressed: false,
            last_mouse_pos: None,
        }
    }

    pub fn mouse_pressed(&self) -> bool {
        self.mouse_pressed
    }

    pub fn handle_mouse_input(&mut self, button: MouseButton, button_state: ElementState) {
        if button == MouseButton::Left {
            self.mouse_pressed = button_state == ElementState::Pressed;
        }
    }

    /// Returns the rotation delta while the left button is held
    pub fn handle_cursor_moved(
        &mut self,
        position: winit::dpi::PhysicalPosition<f64>,
    ) -> Option<(f64, f64)> {
        let mut delta = None;

        if self.mouse_pressed {
            if let Some(last_pos) = self.last_mouse_pos {
                delta = Some((position.x - last_pos.0, position.y - last_pos.1));
            }
        }

        self.last_mouse_pos = Some((position.x, position.y));
        delta
    }
}

impl Default for InputState {
    fn default() -> Self {
        Self::new()
    }
}

/// Camera movement and rotation
pub struct CameraController;

impl CameraController {
    /// Yaw/pitch rotation from a mouse delta, pitch clamped away from the
    /// poles.
    pub fn rotate(camera: &mut Camera, delta_x: f64, delta_y: f64) {
        let sensitivity = RaytracerConfig::CAMERA_ROTATE_SENSITIVITY;
        let mut yaw = camera.front.z.atan2(camera.front.x);
        let mut pitch = camera.front.y.clamp(-1.0, 1.0).asin();

        yaw += delta_x as f32 * sensitivity;
        pitch = (pitch - delta_y as f32 * sensitivity).clamp(
            -RaytracerConfig::CAMERA_PITCH_CLAMP,
            RaytracerConfig::CAMERA_PITCH_CLAMP,
        );

        camera.front = Vec3::new(
            pitch.cos() * yaw.cos(),
            pitch.sin(),
            pitch.cos() * yaw.sin(),
        )
        .normalize();
    }

    /// Moves along the view basis: positive `forward` toward the front
    /// vector, positive `right` along the right vector.
    pub fn translate(camera: &mut Camera, forward: f32, right: f32) {
        let speed = RaytracerConfig::CAMERA_MOVE_SPEED;
        let right_vec = camera.right();
        camera.position += camera.front * (forward * speed) + right_vec * (right * speed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_preserves_unit_length() {
        let mut camera = Camera::new();
        for _ in 0..100 {
            CameraController::rotate(&mut camera, 17.0, -9.0);
            assert!((camera.front.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn pitch_is_clamped_away_from_the_poles() {
        let mut camera = Camera::new();
        for _ in 0..1000 {
            CameraController::rotate(&mut camera, 0.0, -50.0);
        }
        assert!(camera.front.y < 1.0);
        assert!(camera.right().length() > 0.5);
    }

    #[test]
    fn translate_moves_along_the_front_vector() {
        let mut camera = Camera::new();
        let start = camera.position;
        CameraController::translate(&mut camera, 1.0, 0.0);
        let moved = camera.position - start;
        assert!(moved.normalize().dot(camera.front) > 0.999);
    }
}
