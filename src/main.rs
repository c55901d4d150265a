//! Researcher 命令行入口
//!
//! `researcher "<query>" [--model M] [--user U] [--config F]`：通过运行监管执行一次研究，
//! 边跑边打印进度，最后输出研究结果（或错误）。`researcher --list-models` 列出可用模型。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use researcher::config::load_config;
use researcher::core::ResearcherBuilder;
use researcher::observability;
use researcher::research::{ProgressEvent, Stage};

#[derive(Parser, Debug)]
#[command(name = "researcher", version, about = "Research agent: plan, search, synthesize, reflect")]
struct Cli {
    /// 研究问题
    query: Option<String>,

    /// 使用的模型（不在白名单时回退为默认模型）
    #[arg(short, long)]
    model: Option<String>,

    /// 历史记录归属的用户 / 会话 ID
    #[arg(short, long, default_value = "cli")]
    user: String,

    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 列出可用模型后退出
    #[arg(long)]
    list_models: bool,
}

fn print_event(event: &ProgressEvent) {
    println!("[{:>5.1}%] {:<12} {}", event.percent, event.step, event.message);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    observability::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;

    if cli.list_models {
        for model in &config.llm.available_models {
            let marker = if *model == config.llm.default_model { " (default)" } else { "" };
            println!("{model}{marker}");
        }
        return Ok(());
    }

    let query = match cli.query.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => q.to_string(),
        _ => anyhow::bail!("a research query is required (or use --list-models)"),
    };

    let supervisor = ResearcherBuilder::new(config)
        .build()
        .context("Failed to build research pipeline")?;

    let run_id = supervisor
        .start_research(&cli.user, &query, cli.model.as_deref())
        .await;
    let (_, mut events) = supervisor.hub().subscribe_channel(&run_id);

    let wait = supervisor.wait(&run_id);
    tokio::pin!(wait);
    let response = loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            result = &mut wait => break result?,
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    supervisor.shutdown().await;

    if response.status == Stage::Error {
        anyhow::bail!(
            "research failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }

    println!();
    println!("{}", response.research);
    Ok(())
}
