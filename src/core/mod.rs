pub mod cell;
pub mod crystal;
pub mod reflection;
pub mod symmetry;
