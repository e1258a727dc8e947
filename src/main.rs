use clap::Parser;

use stretchy_voxels::config::{Args, SimConfig};

fn main() {
    env_logger::init();
    let config = SimConfig::from(Args::parse());
    stretchy_voxels::run(config);
}
