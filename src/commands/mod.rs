//! 命令行子命令 (CLI subcommands)

pub mod annotate_video;
pub mod track_particles;

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use serde_yaml::Value;

use crate::config::{open_configuration, TrackerConfig};
use crate::console::Console;
use crate::error::{Error, Result};
use crate::job::{configure_jobs, Job};
use crate::pipeline::Outcome;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Locate and link particles for every job of a configuration file
    TrackParticles(ConfigArgs),
    /// Draw previously exported trajectories onto the job videos
    AnnotateVideo(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// YAML configuration file (settings plus a `jobs` list)
    #[arg(short = 'c', long = "configuration", alias = "config", value_name = "FILE")]
    pub config: PathBuf,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::TrackParticles(_) => "track-particles",
            Command::AnnotateVideo(_) => "annotate-video",
        }
    }

    /// Run the command. `Err` means the configuration could not be used at
    /// all; per-job failures only show up in the `Outcome`.
    pub fn run(&self, console: &Console) -> Result<Outcome> {
        match self {
            Command::TrackParticles(args) => track_particles::run(&args.config, console),
            Command::AnnotateVideo(args) => annotate_video::run(&args.config, console),
        }
    }
}

/// Settings and jobs read from one configuration file.
pub(crate) fn load_setup(path: &Path, console: &Console) -> Result<(TrackerConfig, Vec<Job>)> {
    console.message(format!("Reading configuration {}..", path.display()));
    let doc = open_configuration(path)?;
    let config = TrackerConfig::from_mapping(&doc)?;
    tracing::debug!(settings = %config.summary(), "tracker settings");

    let specs = match doc.get("jobs") {
        None => return Err(Error::not_found("attribute <jobs> not found")),
        Some(Value::Sequence(specs)) => specs,
        Some(_) => return Err(Error::type_mismatch("attribute <jobs> must be a list of jobs")),
    };
    console.message(format!("Configuring {} jobs..", specs.len()));
    let jobs = configure_jobs(specs, console);
    console.message(format!("...{} valid jobs", jobs.len()));
    Ok((config, jobs))
}
