pub mod icons;
pub mod wave_progress;

pub use wave_progress::{UiMode, WaveUI};
