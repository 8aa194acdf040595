pub mod resolver;
pub mod spawner;
pub mod terminator;
