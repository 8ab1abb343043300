use clap::{Arg, Command};
use std::sync::Arc;
use tokio::sync::watch;

use rustspot::core::config::{ApiKeys, BotConfig};
use rustspot::core::connector::{ExchangeConnector, PaperConnector};
use rustspot::core::error::BotError;
use rustspot::core::risk_ledger::RiskState;
use rustspot::engine::{summarize, RecoveryLoader};
use rustspot::storage::{FileStore, StateStore, KEY_RISK_STATE};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载环境变量
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("RustSpot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("现货网格/定投交易机器人")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/bot.yaml"),
        )
        .subcommand(Command::new("run").about("启动交易循环（默认）"))
        .subcommand(Command::new("resume").about("清除交易暂停标志后退出"))
        .subcommand(Command::new("stats").about("输出绩效统计后退出"))
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();
    let config = BotConfig::from_file(config_file)?;

    match matches.subcommand() {
        Some(("resume", _)) => resume(&config).await?,
        Some(("stats", _)) => stats(&config).await?,
        _ => run(config).await?,
    }
    Ok(())
}

fn build_connector(config: &BotConfig) -> Result<Arc<dyn ExchangeConnector>, BotError> {
    if config.paper.enabled {
        let quote = config
            .pairs
            .first()
            .map(|p| p.quote.clone())
            .unwrap_or_else(|| "USD".to_string());
        let connector = PaperConnector::new(
            config.paper.initial_quote,
            &quote,
            config.paper.initial_prices.clone(),
        )
        .with_fee(config.paper.fee_pct)
        .with_random_walk(true);
        Ok(Arc::new(connector))
    } else {
        // 密钥校验先行，实盘连接器由外部crate提供后在此接入
        let _keys = ApiKeys::from_env("kraken")?;
        Err(BotError::Config(
            "实盘连接器尚未接入，请使用paper.enabled=true".to_string(),
        ))
    }
}

async fn run(config: BotConfig) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("🚀 RustSpot 启动, {} 个交易对", config.pairs.len());

    let connector = build_connector(&config)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&config.storage.data_dir).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::info!("⌨️ 收到Ctrl+C，优雅退出中");
        shutdown_tx.send(true).ok();
    });

    let mut coordinator = RecoveryLoader::new(config, connector, store)
        .bootstrap()
        .await?;
    coordinator.run(shutdown_rx).await?;
    Ok(())
}

/// 人工确认风险后清除粘性暂停标志
async fn resume(config: &BotConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(&config.storage.data_dir).await?;

    let Some(value) = store.get(KEY_RISK_STATE).await? else {
        log::warn!("⚠️ 未找到风控状态，无需恢复");
        return Ok(());
    };
    let mut state: RiskState = serde_json::from_value(value)?;

    if !state.trading_paused {
        log::info!("✅ 交易未处于暂停状态");
        return Ok(());
    }

    log::warn!(
        "▶️ 清除暂停标志（原因: {}）",
        state.pause_reason.as_deref().unwrap_or("未知")
    );
    state.trading_paused = false;
    state.pause_reason = None;
    store.put(KEY_RISK_STATE, &serde_json::to_value(&state)?).await?;
    Ok(())
}

/// 由成交日志与风控快照汇总绩效
async fn stats(config: &BotConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(&config.storage.data_dir).await?;

    let trades = store.load_trades().await?;
    let Some(value) = store.get(KEY_RISK_STATE).await? else {
        log::warn!("⚠️ 未找到风控状态，尚无统计数据");
        return Ok(());
    };
    let risk: RiskState = serde_json::from_value(value)?;
    let stats = summarize(&trades, &risk);

    println!("=============== 绩效统计 ===============");
    println!("总成交笔数:   {}", stats.total_trades);
    println!("累计买入:     {:.2}", stats.total_bought);
    println!("累计卖出:     {:.2}", stats.total_sold);
    println!("累计手续费:   {:.2}", stats.total_fees);
    println!("已实现盈亏:   {:.2}", stats.realized_pnl);
    println!("当前净值:     {:.2}", stats.equity);
    println!("当前回撤:     {:.2}%", stats.drawdown_pct * 100.0);
    println!("今日盈亏:     {:.2}", stats.daily_pnl);
    println!("交易暂停:     {}", if stats.trading_paused { "是" } else { "否" });
    println!("========================================");
    Ok(())
}
