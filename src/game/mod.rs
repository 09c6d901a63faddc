pub mod constants;
pub mod entity;
pub mod kinds;
pub mod registry;
pub mod authority;
pub mod scene;
pub mod damage;
pub mod player;
pub mod simulation;
pub mod world;
