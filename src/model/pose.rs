use nalgebra::{Isometry3, Vector3};

/// `[tx, ty, tz, wx, wy, wz]`, rotation as a scaled axis.
pub type Twist = [f32; 6];

pub fn twist_to_isometry(twist: &[f32]) -> Isometry3<f32> {
    Isometry3::new(
        Vector3::new(twist[0], twist[1], twist[2]),
        Vector3::new(twist[3], twist[4], twist[5]),
    )
}

pub fn isometry_to_twist(pose: &Isometry3<f32>) -> Twist {
    let t = pose.translation.vector;
    let w = pose.rotation.scaled_axis();
    [t.x, t.y, t.z, w.x, w.y, w.z]
}

/// Left-multiplies each pose by the matching increment of a flat `[M * 6]` buffer.
pub fn apply_increments(poses: &mut [Isometry3<f32>], increments: &[f32]) {
    for (pose, delta) in poses.iter_mut().zip(increments.chunks_exact(6)) {
        *pose = twist_to_isometry(delta) * *pose;
    }
}

/// One KITTI odometry row: the top 3x4 block of the homogeneous matrix.
pub fn kitti_row(pose: &Isometry3<f32>) -> String {
    let matrix = pose.to_homogeneous();
    (0..3)
        .flat_map(|row| (0..4).map(move |col| (row, col)))
        .map(|(row, col)| format!("{:.6e}", matrix[(row, col)]))
        .collect::<Vec<_>>()
        .join(" ")
}
