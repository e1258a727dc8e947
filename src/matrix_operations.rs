use cgmath::{perspective, Deg, Matrix4, Point3, SquareMatrix, Vector3, Vector4};

pub const FIELD_OF_VIEW: Deg<f32> = Deg(60.0);
pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 10000.0;
pub const CAMERA_POSITION: [f32; 3] = [0.0, 0.0, 5.0];

/// cgmath builds GL clip space with z in -1..1, wgpu expects 0..1.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

pub fn projection_matrix(width: u32, height: u32) -> Matrix4<f32> {
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    OPENGL_TO_WGPU_MATRIX * perspective(FIELD_OF_VIEW, aspect, NEAR_PLANE, FAR_PLANE)
}

pub fn view_matrix() -> Matrix4<f32> {
    let eye = Point3::from(CAMERA_POSITION);
    Matrix4::look_to_rh(eye, -Vector3::unit_z(), Vector3::unit_y())
}

/// Centres the field on the x/y axes and pushes it in front of the camera.
pub fn model_matrix(radius: f32) -> Matrix4<f32> {
    Matrix4::from_translation(Vector3::new(-radius, -radius, -radius * 2.0))
}

pub fn flatten_matrix_for_wgpu(matrix: Matrix4<f32>) -> [[f32; 4]; 4] {
    matrix.into()
}

/// Scales clip space so that the screen pixel under `cursor` covers the whole
/// off-screen target and lands on its centre. `cursor` is in window pixels with the
/// origin at the top left.
#[rustfmt::skip]
pub fn pixel_transform(viewport: [f32; 2], cursor: [f32; 2]) -> Matrix4<f32> {
    let [width, height] = viewport;
    let [x, y] = cursor;
    // Column-major.
    Matrix4::new(
        width, 0.0, 0.0, 0.0,
        0.0, height, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        width - x * 2.0, y * 2.0 - height, 0.0, 1.0,
    )
}

/// Window coordinates of `point`: x right and y up in pixels, z the 0..1 depth.
pub fn project(transform: Matrix4<f32>, point: Point3<f32>, viewport: [f32; 2]) -> Vector3<f32> {
    let clip = transform * Vector4::new(point.x, point.y, point.z, 1.0);
    let ndc = clip.truncate() / clip.w;
    Vector3::new(
        (ndc.x + 1.0) / 2.0 * viewport[0],
        (ndc.y + 1.0) / 2.0 * viewport[1],
        ndc.z,
    )
}

/// Inverse of `project`. `None` when the transform is singular.
pub fn unproject(
    window: Vector3<f32>,
    transform: Matrix4<f32>,
    viewport: [f32; 2],
) -> Option<Point3<f32>> {
    let inverse = transform.invert()?;
    let ndc = Vector4::new(
        window.x / viewport[0] * 2.0 - 1.0,
        window.y / viewport[1] * 2.0 - 1.0,
        window.z,
        1.0,
    );
    let world = inverse * ndc;
    if world.w.abs() < f32::EPSILON {
        return None;
    }
    Some(Point3::from_homogeneous(world))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::InnerSpace;

    const VIEWPORT: [f32; 2] = [800.0, 600.0];

    fn frame_transform() -> Matrix4<f32> {
        projection_matrix(800, 600) * view_matrix() * model_matrix(10.0)
    }

    #[test]
    fn test_project_unproject_round_trip() {
        let transform = frame_transform();
        for point in [
            Point3::new(10.0, 10.0, 10.0),
            Point3::new(3.0, 17.0, 1.5),
            Point3::new(0.0, 0.0, 0.0),
        ] {
            let window = project(transform, point, VIEWPORT);
            assert!(window.z > 0.0 && window.z < 1.0);
            let back = unproject(window, transform, VIEWPORT).expect("transform is invertible");
            assert!((back - point).magnitude() < 1e-2, "{:?} came back as {:?}", point, back);
        }
    }

    #[test]
    fn test_sphere_centre_is_in_view() {
        let window = project(frame_transform(), Point3::new(10.0, 10.0, 10.0), VIEWPORT);
        assert!((window.x - 400.0).abs() < 1.0);
        assert!((window.y - 300.0).abs() < 1.0);
    }

    #[test]
    fn test_pixel_transform_centres_cursor() {
        let transform = frame_transform();
        let point = Point3::new(4.0, 12.0, 9.0);
        let window = project(transform, point, VIEWPORT);
        let cursor = [window.x, VIEWPORT[1] - window.y];

        let homogeneous = Vector4::new(point.x, point.y, point.z, 1.0);
        let picked = pixel_transform(VIEWPORT, cursor) * transform * homogeneous;
        let ndc = picked.truncate() / picked.w;
        assert!(ndc.x.abs() < 1e-2, "x landed at {}", ndc.x);
        assert!(ndc.y.abs() < 1e-2, "y landed at {}", ndc.y);
        assert!((ndc.z - window.z).abs() < 1e-6);

        // One screen pixel to the right spans the full target.
        let nudged_cursor = [cursor[0] - 1.0, cursor[1]];
        let shifted = pixel_transform(VIEWPORT, nudged_cursor) * transform * homogeneous;
        assert!((shifted.x / shifted.w - 2.0).abs() < 1e-2);
    }
}
