/// 配置系统 (Configuration)
///
/// - parser:   YAML 属性的类型化读取
/// - settings: 跟踪器 / 标注器参数及默认值
pub mod parser;
pub mod settings;

pub use parser::open_configuration;
pub use settings::{
    AnnotateConfig, ExportFormat, FilterConfig, Flip, LinkConfig, LocateConfig, TrackerConfig,
};
