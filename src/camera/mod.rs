/// Camera Module
///
/// Data-oriented camera consumed by the culling pipeline.
pub mod data_camera;

pub use data_camera::{
    build_projection_matrix, build_view_matrix, calculate_forward_vector, extract_frustum_planes,
    init_camera, look_at, projection_coefficients, CameraData,
};
