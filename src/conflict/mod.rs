/// This module contains logic for detecting and recording conflicts.
pub mod detection;
/// This module contains logic for resolving conflicts.
pub mod resolution;
