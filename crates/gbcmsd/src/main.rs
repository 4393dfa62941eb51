// gbcmsd 守护进程
// 配置加载、信令与存储初始化、重启恢复、周期任务与 HTTP 服务

use clap::Parser;
use gbcms_core::cascade::CascadeManager;
use gbcms_core::context::CmsContext;
use gbcms_core::handler::Dispatcher;
use gbcms_core::recover;
use gbcms_core::subscribe::SubscriptionEngine;
use gbcms_core::Config;
use gbcms_sip::SipTransport;
use gbcms_store::{Store, WriteOp};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod api;

#[derive(Parser, Debug)]
#[command(author, version, about = "GB/T 28181 信令管理服务")]
struct Args {
    /// 配置文件路径，缺失时使用内置默认值
    #[arg(long, default_value = "gbcms.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cfg.log.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if !args.config.exists() {
        tracing::warn!(target: "gbcmsd", "config {} not found, using defaults", args.config.display());
    }

    let db = gbcms_store::repo::connect(&cfg.db.url).await?;
    gbcms_store::repo::init_schema(&db).await?;
    let writer = gbcms_store::spawn_writer(db.clone());

    let transport = SipTransport::new();
    transport.bind(&cfg.sip.listen_ip, cfg.sip.port).await?;
    tracing::info!(target: "gbcmsd", "sip listening on {}:{}", cfg.sip.listen_ip, cfg.sip.port);

    let http_listen = cfg.http.listen.clone();
    let reserve = (cfg.db.position_reserve_days, cfg.db.alarm_reserve_days);
    let ctx = CmsContext::new(cfg, transport.clone(), Store::new(db), writer);
    let cascades = CascadeManager::new(ctx.clone());
    let subs = Arc::new(SubscriptionEngine::new());
    let dispatcher = Dispatcher::new(ctx.clone(), cascades.clone(), subs.clone());
    transport.set_handler(dispatcher).await;

    let summary = recover::run(&ctx, &subs).await?;
    tracing::info!(
        target: "gbcmsd",
        devices = summary.devices,
        streams = summary.streams_restored,
        "state recovered"
    );

    let started = cascades.start_enabled().await?;
    if started > 0 {
        tracing::info!(target: "gbcmsd", started, "cascade UAs started");
    }

    ctx.devices
        .clone()
        .spawn_sweeper(ctx.engine.clone(), ctx.dialogs.clone());
    spawn_housekeeping(ctx.clone(), subs.clone(), reserve);

    let app = api::router(api::AppState {
        ctx,
        cascades,
        subs,
    });
    let addr = http_listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid http listen {}: {}", http_listen, e))?;
    tracing::info!(target: "gbcmsd", "http listening on {}", http_listen);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// 周期任务：目录聚合巡检、订阅续订、每日 03:00 历史数据清理
fn spawn_housekeeping(
    ctx: Arc<CmsContext>,
    subs: Arc<SubscriptionEngine>,
    (position_days, alarm_days): (i64, i64),
) {
    tokio::spawn(async move {
        let mut minute = tokio::time::interval(Duration::from_secs(60));
        let purge_at = tokio::time::sleep(until_next_purge());
        tokio::pin!(purge_at);
        loop {
            tokio::select! {
                _ = minute.tick() => {
                    ctx.catalogs.sweep_stalled().await;
                    subs.refresh_due(&ctx).await;
                }
                _ = &mut purge_at => {
                    let now = chrono::Utc::now();
                    let op = WriteOp::Purge {
                        positions_before: now - chrono::Duration::days(position_days),
                        alarms_before: now - chrono::Duration::days(alarm_days),
                    };
                    if let Err(e) = ctx.writer.post(op).await {
                        tracing::warn!(target: "gbcmsd", "history purge failed: {}", e);
                    }
                    purge_at.as_mut().reset(tokio::time::Instant::now() + until_next_purge());
                }
            }
        }
    });
}

/// 距下一次 03:00（本地时间）的时长
fn until_next_purge() -> Duration {
    use chrono::{Local, NaiveTime, TimeZone};
    let now = Local::now();
    let today_3am = now
        .date_naive()
        .and_time(NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default());
    let mut next = Local
        .from_local_datetime(&today_3am)
        .earliest()
        .unwrap_or(now);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::from_secs(24 * 3600))
}
