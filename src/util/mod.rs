pub mod vector;

pub use vector::{Quat, Vec2, Vec3};
