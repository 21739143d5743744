pub mod java;
pub mod javascript;
pub mod python;
