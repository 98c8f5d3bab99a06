use std::path::Path;

use super::load_setup;
use crate::console::Console;
use crate::error::Result;
use crate::pipeline::{self, Outcome};

pub fn run(config_path: &Path, console: &Console) -> Result<Outcome> {
    let (config, jobs) = load_setup(config_path, console)?;
    Ok(pipeline::track_particles(&config, jobs, console))
}
