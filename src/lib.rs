// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 轨迹标注视频
pub mod commands; // 命令行子命令
pub mod config; // 配置解析与参数
pub mod console; // 终端输出
pub mod error; // 错误类型
pub mod job; // 作业模型与工厂
pub mod pipeline; // 批处理流水线
pub mod tracking; // 粒子定位、链接、过滤
pub mod video; // 视频读写与帧处理

pub use crate::config::TrackerConfig;
pub use crate::console::Console;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::job::{configure_jobs, Job, Period, PeriodUnit, Stage};
pub use crate::pipeline::Outcome;
pub use crate::tracking::{Feature, FeatureLocator, TrajectoryLinker};
pub use crate::video::{FrameSink, FrameSource};

/// Local timestamp with every field separated by `delimiter`.
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_time_string() {
        let s = gen_time_string("-");
        assert_eq!(s.split('-').count(), 6);
        assert_eq!(s.len(), 19);
    }
}
