//! 作业工厂: 从配置列表构建作业, 无效条目跳过并给出原因
//! Job factory. Never fails: invalid entries are reported and skipped.

use serde_yaml::{Mapping, Value};

use super::{Job, Period, PeriodUnit};
use crate::config::parser::{
    parse_directory, parse_file, parse_int_sequence, parse_ints, parse_ints_or_floats,
    parse_optional,
};
use crate::console::Console;
use crate::error::{ErrorKind, Result};

const PERIOD_KEYS: [(&str, PeriodUnit); 3] = [
    ("period-frame", PeriodUnit::Frame),
    ("period-second", PeriodUnit::Second),
    ("period-minute", PeriodUnit::Minute),
];

/// Build a job for every valid entry of `specs`, in order.
pub fn configure_jobs(specs: &[Value], console: &Console) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (i, spec) in specs.iter().enumerate() {
        let number = i + 1;
        match configure_job(spec) {
            Ok(job) => {
                tracing::debug!(job = number, video = %job.video().display(), "job configured");
                jobs.push(job);
            }
            Err(reason) => {
                tracing::warn!(job = number, %reason, "job skipped");
                console.warning(format!("...Job {}: {}. Skipping job.", number, reason));
            }
        }
    }
    jobs
}

fn configure_job(spec: &Value) -> std::result::Result<Job, String> {
    let src = spec
        .as_mapping()
        .ok_or_else(|| "Job entry is not a mapping of attributes".to_string())?;

    let video = match parse_file(src, "video") {
        Ok(path) => path,
        Err(e) if e.is(ErrorKind::NotFound) => {
            return Err("Attribute <video> not found".to_string())
        }
        Err(e) if e.is(ErrorKind::Io) => return Err("Video file not found".to_string()),
        Err(e) => return Err(invalid(e.message())),
    };

    // 输出目录缺失或不存在时回落到视频所在目录
    let outdir = parse_directory(src, "outdir").ok();

    let margins = parse_optional(parse_ints(src, "crop-margins", 4)).map_err(|e| invalid(e.message()))?;
    let period = parse_period(src)?;
    let particles = parse_optional(parse_int_sequence(src, "annotate-particles"))
        .map_err(|e| invalid(e.message()))?;

    let mut job = Job::new(video, outdir, margins, period);
    if let Some(ids) = particles {
        job.set_annotated_particles(ids);
    }
    Ok(job)
}

fn parse_period(src: &Mapping) -> std::result::Result<Option<Period>, String> {
    let present: Vec<_> = PERIOD_KEYS
        .iter()
        .filter(|(key, _)| src.contains_key(*key))
        .collect();
    let (key, unit) = match present.as_slice() {
        [] => return Ok(None),
        [one] => **one,
        _ => {
            return Err(
                "<period-frame>, <period-second> and <period-minute> are mutually exclusive"
                    .to_string(),
            )
        }
    };
    let bounds: Result<Vec<f64>> = match unit {
        PeriodUnit::Frame => {
            parse_ints(src, key, 2).map(|v| v.into_iter().map(|x| x as f64).collect())
        }
        _ => parse_ints_or_floats(src, key, 2),
    };
    let bounds = bounds.map_err(|e| invalid(e.message()))?;
    Ok(Some(Period::new(bounds[0], bounds[1], unit)))
}

fn invalid(message: &str) -> String {
    format!("Invalid attribute ({})", message)
}
