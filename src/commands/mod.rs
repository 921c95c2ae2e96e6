
pub mod info;
pub mod angles;
pub mod rotations;
