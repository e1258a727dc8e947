use std::path::PathBuf;

use clap::Parser;

use crate::voxel_pass::RenderMode;

pub const RADIUS: f32 = 10.0;
pub const PHYS_STEPS_PER_FRAME: u32 = 2;
pub const SLOWDOWN_FACTOR: u32 = 1;
pub const PICK_TARGET_SIZE: u32 = 100;
pub const FRAME_RATE: f32 = 60.0;

#[derive(Parser, Debug, Clone)]
#[command(name = "stretchy-voxels", about = "GPU rubber-band voxel physics viewer")]
pub struct Args {
    /// Radius of the voxelised sphere, in cells.
    #[arg(long, default_value_t = RADIUS)]
    pub radius: f32,

    /// Physics sub-steps per rendered frame. Must be even.
    #[arg(long, default_value_t = PHYS_STEPS_PER_FRAME)]
    pub steps_per_frame: u32,

    /// Only run one in every N sub-step pairs.
    #[arg(long, default_value_t = SLOWDOWN_FACTOR)]
    pub slowdown: u32,

    #[arg(long, value_enum, default_value_t = RenderMode::Stretchy)]
    pub render_mode: RenderMode,

    /// Overlay velocity and angular velocity segments per cell.
    #[arg(long)]
    pub draw_vectors: bool,

    /// Start with the simulation running instead of paused.
    #[arg(long)]
    pub run: bool,

    /// Write the picking target to this directory as PNG on every click.
    #[arg(long)]
    pub dump_picks: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    pub radius: f32,
    pub steps_per_frame: u32,
    pub slowdown: u32,
    pub render_mode: RenderMode,
    pub draw_vectors: bool,
    pub start_paused: bool,
    pub dump_picks: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            radius: RADIUS,
            steps_per_frame: PHYS_STEPS_PER_FRAME,
            slowdown: SLOWDOWN_FACTOR,
            render_mode: RenderMode::Stretchy,
            draw_vectors: false,
            start_paused: true,
            dump_picks: None,
        }
    }
}

impl From<Args> for SimConfig {
    fn from(args: Args) -> Self {
        let config = Self {
            radius: args.radius,
            steps_per_frame: args.steps_per_frame,
            slowdown: args.slowdown,
            render_mode: args.render_mode,
            draw_vectors: args.draw_vectors,
            start_paused: !args.run,
            dump_picks: args.dump_picks,
        };
        config.assert_valid();
        config
    }
}

impl SimConfig {
    /// Sub-steps are issued in pairs so every frame ends on the primary state set.
    pub fn assert_valid(&self) {
        assert!(self.radius > 0.0, "radius must be positive, got {}", self.radius);
        assert!(
            self.steps_per_frame > 0 && self.steps_per_frame % 2 == 0,
            "steps per frame must be a positive even number, got {}",
            self.steps_per_frame
        );
        assert!(self.slowdown > 0, "slowdown factor must be positive");
        assert!(
            (self.steps_per_frame / 2) % self.slowdown == 0,
            "slowdown factor {} must divide the {} sub-step pairs per frame",
            self.slowdown,
            self.steps_per_frame / 2
        );
    }

    pub fn time_step(&self) -> f32 {
        1.0 / FRAME_RATE / self.steps_per_frame as f32
    }

    pub fn pairs_per_frame(&self) -> u32 {
        self.steps_per_frame / 2 / self.slowdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SimConfig::default();
        config.assert_valid();
        assert_eq!(config.pairs_per_frame(), 1);
        assert!((config.time_step() - 1.0 / 120.0).abs() < 1e-7);
        assert!(config.start_paused);
    }

    #[test]
    fn test_args_map_to_config() {
        let args = Args::parse_from([
            "stretchy-voxels",
            "--radius",
            "4",
            "--steps-per-frame",
            "8",
            "--slowdown",
            "2",
            "--run",
            "--render-mode",
            "cubes",
        ]);
        let config = SimConfig::from(args);
        assert_eq!(config.radius, 4.0);
        assert_eq!(config.pairs_per_frame(), 2);
        assert_eq!(config.render_mode, RenderMode::Cubes);
        assert!(!config.start_paused);
    }

    #[test]
    #[should_panic(expected = "even")]
    fn test_odd_step_count_is_rejected() {
        SimConfig {
            steps_per_frame: 3,
            ..SimConfig::default()
        }
        .assert_valid();
    }

    #[test]
    #[should_panic(expected = "slowdown")]
    fn test_slowdown_must_divide_pairs() {
        SimConfig {
            steps_per_frame: 6,
            slowdown: 2,
            ..SimConfig::default()
        }
        .assert_valid();
    }
}
