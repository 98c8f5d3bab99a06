/// partrack 命令行入口
///
/// 读取 YAML 作业文件, 逐个作业执行粒子定位、链接、导出与视频标注.
///
/// 退出码:
/// - 0  (EX_OK):     至少一个作业完成
/// - 78 (EX_CONFIG): 配置错误, 或没有作业完成
use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use partrack::commands::Command;
use partrack::console::Console;
use partrack::pipeline::Outcome;

const EX_OK: u8 = 0;
const EX_CONFIG: u8 = 78;

#[derive(Parser, Debug)]
#[command(author, version, about = "partrack - 视频粒子轨迹批处理", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 日志级别 (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// 禁用彩色输出
    #[arg(long, global = true)]
    no_color: bool,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG 优先
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("partrack={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli, console: &Console) -> anyhow::Result<Outcome> {
    cli.command
        .run(console)
        .with_context(|| format!("{} aborted", cli.command.name()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let console = Console::new(!cli.no_color && std::io::stdout().is_terminal());
    console.message(format!(
        "🚀 partrack {} | {} | {}",
        env!("CARGO_PKG_VERSION"),
        cli.command.name(),
        partrack::gen_time_string("-")
    ));

    match run(&cli, &console) {
        Ok(outcome) if outcome.success() => ExitCode::from(EX_OK),
        Ok(_) => ExitCode::from(EX_CONFIG),
        Err(e) => {
            console.error(format!("❌ {:#}", e));
            ExitCode::from(EX_CONFIG)
        }
    }
}
