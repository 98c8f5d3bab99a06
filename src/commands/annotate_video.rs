use std::path::Path;

use super::load_setup;
use crate::console::Console;
use crate::error::Result;
use crate::pipeline::{self, Outcome};

/// Annotate from the tracks exported in `export-format`. The `annotate`
/// switch is implied; every other `annotate-*` option applies.
pub fn run(config_path: &Path, console: &Console) -> Result<Outcome> {
    let (mut config, jobs) = load_setup(config_path, console)?;
    config.annotate.enabled = true;
    Ok(pipeline::annotate_videos(&config, jobs, console))
}
