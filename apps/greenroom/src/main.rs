//! Scripted walkthrough of the realtime layer against the in-process
//! transport: a change feed following a `posts` table and a presence room
//! with members joining and leaving.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use greenroom_realtime::{
    ChangeEvent, FeedScope, Keyed, PresencePhase, RealtimeClient,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(
    name = "greenroom",
    author,
    version,
    about = "Greenroom realtime sync demo (in-process transport)"
)]
struct Cli {
    /// Minimum log level (error, warn, info, debug, trace).
    #[arg(long, env = "GREENROOM_LOG", default_value = "info")]
    log_level: String,

    /// Presence room to join during the walkthrough.
    #[arg(long, default_value = "room-1")]
    room: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Post {
    id: String,
    author: String,
    likes: u32,
}

impl Keyed for Post {
    fn key(&self) -> &str {
        &self.id
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(&cli.room).await
}

async fn run(room: &str) -> Result<()> {
    let local = RealtimeClient::local();

    local.tables.upsert(
        "posts",
        serde_json::json!({"id": "p1", "author": "ada", "likes": 1}),
    );
    local.tables.upsert(
        "posts",
        serde_json::json!({"id": "p2", "author": "grace", "likes": 4}),
    );

    let scope = FeedScope::table("posts");
    let mut feed = local.client.feed::<Post>(scope.clone()).await;
    let mut rows = feed.watch_rows();
    timeout(WAIT, rows.wait_for(|rows| rows.len() == 2))
        .await
        .context("seed fetch did not land")?
        .context("feed closed")?;
    info!(rows = feed.rows().len(), "feed seeded");

    local
        .transport
        .emit(
            &scope,
            &ChangeEvent::update(serde_json::json!({"id": "p1", "author": "ada", "likes": 2})),
        )
        .context("emit update")?;
    timeout(
        WAIT,
        rows.wait_for(|rows| rows.iter().any(|p| p.id == "p1" && p.likes == 2)),
    )
    .await
    .context("update did not apply")?
    .context("feed closed")?;
    info!("update applied: p1 now has 2 likes");

    local
        .transport
        .emit(&scope, &ChangeEvent::delete(serde_json::json!({"id": "p2"})))
        .context("emit delete")?;
    timeout(WAIT, rows.wait_for(|rows| rows.len() == 1))
        .await
        .context("delete did not apply")?
        .context("feed closed")?;
    info!("delete applied: p2 removed");

    for post in feed.rows() {
        info!(id = %post.id, author = %post.author, likes = post.likes, "post");
    }

    let mut host = local.client.presence(room, "host").await;
    let mut phase = host.watch_phase();
    timeout(WAIT, phase.wait_for(|p| *p == PresencePhase::Announced))
        .await
        .context("host never announced")?
        .context("presence closed")?;

    let mut guest = local.client.presence(room, "guest").await;
    let mut online = host.watch_snapshot();
    timeout(WAIT, online.wait_for(|s| s.len() == 2))
        .await
        .context("guest never appeared")?
        .context("presence closed")?;
    info!(room = %room, online = ?host.online(), "room is live");

    guest.leave().await;
    timeout(WAIT, online.wait_for(|s| s.len() == 1))
        .await
        .context("guest never left")?
        .context("presence closed")?;
    info!(room = %room, online = ?host.online(), "guest left");

    host.leave().await;
    feed.close().await;
    info!("walkthrough complete");
    Ok(())
}
